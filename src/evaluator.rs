//! The parallel evaluator.
//!
//! One call to [`Evaluator::evaluate`] is a run. The run advances the graph's
//! clock, claims the roots and spawns one task per runnable key on a rayon
//! scope. A task either re-verifies the recorded dependencies of a dirty node
//! or invokes its function. A function that asks for an unfinished dependency
//! returns `Ok(None)` and the task ends; the last dependency to settle spawns
//! the task again. When the scope drains with claimed nodes still unfinished
//! they are all parked on each other, which means a cycle.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::Scope;
use tracing::{debug, trace, warn};

use crate::cancel::CancellationToken;
use crate::cycle::{self, CycleReport};
use crate::diagnostic::{Diagnostic, EventFilter, StoreAll};
use crate::entry::{Completion, NodeEntry, Phase, Settled};
use crate::error::{BuildError, ComputeError, EvaluationError, NodeError};
use crate::function::{ComputeResult, Environment, FunctionRegistry, NodeFunction};
use crate::graph::InMemoryGraph;
use crate::key::{NodeKey, NodeKind};
use crate::result::EvaluationResult;
use crate::tracer::{ExecutionResult, NoopTracer, SpanId, Tracer};
use crate::value::NodeValue;
use crate::version::Version;

/// Parallel, incremental evaluator over an [`InMemoryGraph`].
///
/// The evaluator owns its graph, function registry, event filter, tracer and
/// worker pool. `evaluate`, `invalidate`, `inject` and `remove_if_unused`
/// serialize on an internal session lock; within a run, work is spread over
/// the pool.
///
/// # Example
///
/// ```
/// use nodeflow::{Evaluator, Environment, NodeKey, NodeKind, NodeValue, ComputeResult};
///
/// const NUM: NodeKind = NodeKind::new("NUM");
/// const SUM: NodeKind = NodeKind::new("SUM");
///
/// let evaluator = Evaluator::builder()
///     .function(NUM, |key: &NodeKey, _env: &mut Environment<'_>| -> ComputeResult {
///         let n = *key.argument::<u32>().unwrap();
///         Ok(Some(NodeValue::new(n as u64)))
///     })
///     .function(SUM, |key: &NodeKey, env: &mut Environment<'_>| -> ComputeResult {
///         let n = *key.argument::<u32>().unwrap();
///         let deps: Vec<NodeKey> = (1..=n).map(|i| NodeKey::new(NUM, i)).collect();
///         let values = env.get_values(&deps);
///         if env.values_missing() {
///             return Ok(None);
///         }
///         let sum = values.iter().flatten().filter_map(|v| v.downcast_ref::<u64>()).sum::<u64>();
///         Ok(Some(NodeValue::new(sum)))
///     })
///     .build()
///     .unwrap();
///
/// let root = NodeKey::new(SUM, 4u32);
/// let result = evaluator.evaluate(&[root.clone()], false).unwrap();
/// assert_eq!(result.get_as::<u64>(&root), Some(&10));
/// ```
pub struct Evaluator<T: Tracer = NoopTracer> {
    pub(crate) graph: Arc<InMemoryGraph>,
    pub(crate) registry: FunctionRegistry,
    pub(crate) event_filter: Arc<dyn EventFilter>,
    pub(crate) tracer: T,
    pool: rayon::ThreadPool,
    pub(crate) session: Mutex<()>,
}

impl Evaluator<NoopTracer> {
    /// Create a builder with default settings.
    pub fn builder() -> EvaluatorBuilder<NoopTracer> {
        EvaluatorBuilder::new()
    }

    /// Create an evaluator for `registry` with default settings.
    pub fn new(registry: FunctionRegistry) -> Result<Self, BuildError> {
        Self::builder().registry(registry).build()
    }
}

impl<T: Tracer> Evaluator<T> {
    /// Evaluate `roots` and return their values or errors.
    ///
    /// With `keep_going` a failed node wakes its dependents so they can
    /// recover, and every independent root is still computed. Without it the
    /// run stops scheduling work after the first failure and reports each
    /// unfinished root with a [`NodeError::Dependency`] leading to the failure.
    pub fn evaluate(
        &self,
        roots: &[NodeKey],
        keep_going: bool,
    ) -> Result<EvaluationResult, EvaluationError> {
        self.evaluate_with_cancel(roots, keep_going, &CancellationToken::new())
    }

    /// Like [`evaluate`](Self::evaluate), but gives up as soon as `cancel` is
    /// signaled. Every unfinished node is then rolled back to its state before
    /// the run and `EvaluationError::Interrupted` is returned.
    pub fn evaluate_with_cancel(
        &self,
        roots: &[NodeKey],
        keep_going: bool,
        cancel: &CancellationToken,
    ) -> Result<EvaluationResult, EvaluationError> {
        let _session = self.session.lock();
        let version = self.graph.clock().advance();
        debug!(
            version = version.0,
            roots = roots.len(),
            keep_going,
            "evaluation started"
        );
        let run = Run {
            evaluator: self,
            state: RunState {
                graph: self.graph.clone(),
                version,
                keep_going,
                store_events: self.event_filter.store_events_and_posts(),
                cancel: cancel.clone(),
                claimed: papaya::HashMap::with_hasher(ahash::RandomState::new()),
                stopped: AtomicBool::new(false),
                interrupted: AtomicBool::new(false),
                fatal: Mutex::new(None),
            },
        };
        let result = run.execute(roots);
        match &result {
            Ok(result) => debug!(
                version = version.0,
                errors = result.errors().count(),
                unfinished = result.unfinished().len(),
                "evaluation finished"
            ),
            Err(error) => debug!(version = version.0, %error, "evaluation aborted"),
        }
        result
    }

    /// The value of `key`, if it is computed and clean.
    pub fn get_value(&self, key: &NodeKey) -> Option<NodeValue> {
        self.graph.get(key)?.value()
    }

    /// The error of `key`, if it failed and is clean.
    pub fn get_error(&self, key: &NodeKey) -> Option<NodeError> {
        self.graph.get(key)?.error()
    }

    /// The entry of `key`, if one exists.
    pub fn entry(&self, key: &NodeKey) -> Option<Arc<NodeEntry>> {
        self.graph.get(key)
    }

    /// The underlying graph.
    pub fn graph(&self) -> &InMemoryGraph {
        &self.graph
    }

    /// The current version of the graph's clock.
    pub fn version(&self) -> Version {
        self.graph.version()
    }

    /// The tracer.
    pub fn tracer(&self) -> &T {
        &self.tracer
    }

    /// The function registry.
    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Drop the entry of `key` if nothing depends on it.
    ///
    /// Returns true if the entry was removed.
    pub fn remove_if_unused(&self, key: &NodeKey) -> bool {
        let _session = self.session.lock();
        let removed = self.graph.remove_if_unused(key);
        if removed {
            trace!(key = ?key, "removed unused node");
        }
        removed
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Evaluator`].
pub struct EvaluatorBuilder<T: Tracer = NoopTracer> {
    threads: Option<usize>,
    event_filter: Arc<dyn EventFilter>,
    registry: FunctionRegistry,
    tracer: T,
}

impl Default for EvaluatorBuilder<NoopTracer> {
    fn default() -> Self {
        Self::new()
    }
}

impl EvaluatorBuilder<NoopTracer> {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            threads: None,
            event_filter: Arc::new(StoreAll),
            registry: FunctionRegistry::new(),
            tracer: NoopTracer,
        }
    }
}

impl<T: Tracer> EvaluatorBuilder<T> {
    /// Number of worker threads. Defaults to the available parallelism.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Set the filter deciding which diagnostics are stored. Defaults to
    /// [`StoreAll`].
    pub fn event_filter(mut self, filter: impl EventFilter) -> Self {
        self.event_filter = Arc::new(filter);
        self
    }

    /// Register a closure computing keys of `kind`.
    pub fn function<F>(mut self, kind: NodeKind, function: F) -> Self
    where
        F: Fn(&NodeKey, &mut Environment<'_>) -> ComputeResult + Send + Sync + 'static,
    {
        self.registry.register(kind, function);
        self
    }

    /// Register a [`NodeFunction`] computing keys of `kind`.
    pub fn node_function(mut self, kind: NodeKind, function: impl NodeFunction) -> Self {
        self.registry.register_function(kind, function);
        self
    }

    /// Replace the whole function registry.
    pub fn registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the tracer.
    pub fn tracer<U: Tracer>(self, tracer: U) -> EvaluatorBuilder<U> {
        EvaluatorBuilder {
            threads: self.threads,
            event_filter: self.event_filter,
            registry: self.registry,
            tracer,
        }
    }

    /// Build the evaluator with the configured settings.
    pub fn build(self) -> Result<Evaluator<T>, BuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads.unwrap_or(0))
            .thread_name(|i| format!("nodeflow-worker-{i}"))
            .build()?;
        Ok(Evaluator {
            graph: Arc::new(InMemoryGraph::new()),
            registry: self.registry,
            event_filter: self.event_filter,
            tracer: self.tracer,
            pool,
            session: Mutex::new(()),
        })
    }
}

// ============================================================================
// Run state
// ============================================================================

/// Outcome of asking for a dependency.
pub(crate) enum DepLookup {
    /// The dependency is complete and clean.
    Ready(Settled),
    /// The requester was registered as a waiter. `claimed` is true if this
    /// request made the current run the owner of the dependency, in which case
    /// the requester must spawn it.
    Pending { claimed: bool },
}

/// State shared by every task of one run.
pub(crate) struct RunState {
    graph: Arc<InMemoryGraph>,
    version: Version,
    keep_going: bool,
    store_events: bool,
    cancel: CancellationToken,
    claimed: papaya::HashMap<NodeKey, Arc<NodeEntry>, ahash::RandomState>,
    /// No new tasks are started once set.
    stopped: AtomicBool,
    interrupted: AtomicBool,
    fatal: Mutex<Option<EvaluationError>>,
}

impl RunState {
    pub(crate) fn stores_events(&self) -> bool {
        self.store_events
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Look `dep` up on behalf of `requester`.
    pub(crate) fn request(
        &self,
        requester: &NodeKey,
        requester_entry: &NodeEntry,
        dep: &NodeKey,
    ) -> DepLookup {
        let dep_entry = self.graph.get_or_create(dep);
        let claimed = {
            let mut data = dep_entry.lock();
            if let Some(settled) = data.settled() {
                return DepLookup::Ready(settled);
            }
            let claimed = data.claim(self.version);
            data.waiters.push(requester.clone());
            // Counted before the dependency lock is released, so its
            // completion cannot signal a waiter that is not counted yet.
            requester_entry.add_pending();
            claimed
        };
        if claimed {
            self.claimed.pin().insert(dep.clone(), dep_entry);
        }
        DepLookup::Pending { claimed }
    }

    fn may_schedule(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.stop();
    }

    fn abort(&self, error: EvaluationError) {
        warn!(%error, "aborting evaluation");
        self.fatal.lock().get_or_insert(error);
        self.stop();
    }
}

struct Run<'e, T: Tracer> {
    evaluator: &'e Evaluator<T>,
    state: RunState,
}

impl<'e, T: Tracer> Run<'e, T> {
    fn execute(&self, roots: &[NodeKey]) -> Result<EvaluationResult, EvaluationError> {
        let mut initial = Vec::new();
        for root in roots {
            let entry = self.state.graph.get_or_create(root);
            let claimed = entry.lock().claim(self.state.version);
            if claimed {
                self.state.claimed.pin().insert(root.clone(), entry);
                initial.push(root.clone());
            }
        }

        self.evaluator.pool.scope(|scope| {
            for key in initial {
                self.spawn(scope, key);
            }
        });

        while self.state.may_schedule() {
            let report = self.detect_cycles();
            if report.is_empty() {
                break;
            }
            self.evaluator
                .pool
                .scope(|scope| self.fail_cycles(scope, report));
        }

        let fatal = self.state.fatal.lock().take();
        let outcome = if let Some(error) = fatal {
            Err(error)
        } else if self.state.interrupted.load(Ordering::SeqCst) || self.state.is_cancelled() {
            Err(EvaluationError::Interrupted)
        } else {
            Ok(self.collect(roots))
        };
        self.rollback();
        outcome
    }

    fn spawn<'s>(&'s self, scope: &Scope<'s>, key: NodeKey) {
        if !self.state.may_schedule() {
            return;
        }
        trace!(key = ?key, "scheduling");
        scope.spawn(move |scope| self.run_task(scope, key));
    }

    fn run_task<'s>(&'s self, scope: &Scope<'s>, key: NodeKey) {
        if !self.state.may_schedule() {
            return;
        }
        let Some(entry) = self.state.graph.get(&key) else {
            return;
        };
        let phase = match &entry.lock().in_flight {
            Some(in_flight) if in_flight.version == self.state.version => in_flight.phase,
            _ => return,
        };
        match phase {
            Phase::CheckingDeps { group } => self.check_deps(scope, key, entry, group),
            Phase::Computing => self.compute(scope, key, entry),
        }
    }

    /// Walk the recorded dependency groups of a dirty node from `first_group`.
    fn check_deps<'s>(
        &'s self,
        scope: &Scope<'s>,
        key: NodeKey,
        entry: Arc<NodeEntry>,
        first_group: usize,
    ) {
        let tracer = &self.evaluator.tracer;
        let span = tracer.new_span_id();
        tracer.on_node_start(span, &key);
        let (deps, evaluated_at) = {
            let data = entry.lock();
            (data.direct_deps.clone(), data.evaluated_at)
        };

        for (index, group) in deps.groups().iter().enumerate().skip(first_group) {
            entry.arm();
            let mut to_schedule = Vec::new();
            let mut waiting = false;
            let mut changed = false;
            for dep in group {
                if self.state.is_cancelled() {
                    return;
                }
                match self.state.request(&key, &entry, dep) {
                    DepLookup::Ready(settled) => changed |= settled.changed_at > evaluated_at,
                    DepLookup::Pending { claimed } => {
                        waiting = true;
                        if claimed {
                            to_schedule.push(dep.clone());
                        }
                    }
                }
            }

            if waiting {
                if let Some(in_flight) = entry.lock().in_flight.as_mut() {
                    in_flight.phase = Phase::CheckingDeps { group: index };
                }
                tracer.on_node_end(span, &key, &ExecutionResult::Parked);
                for dep in to_schedule {
                    self.spawn(scope, dep);
                }
                if entry.release_one() {
                    self.spawn(scope, key);
                }
                return;
            }
            entry.release_one();

            if changed {
                trace!(key = ?key, group = index, "dependency changed");
                if let Some(in_flight) = entry.lock().in_flight.as_mut() {
                    in_flight.phase = Phase::Computing;
                }
                tracer.on_node_end(span, &key, &ExecutionResult::DependencyChanged);
                return self.compute(scope, key, entry);
            }
        }

        let waiters = entry.lock().mark_clean(self.state.version);
        trace!(key = ?key, "verified clean");
        tracer.on_node_end(span, &key, &ExecutionResult::Verified);
        self.signal(scope, waiters);
    }

    /// Invoke the function of `key` once.
    fn compute<'s>(&'s self, scope: &Scope<'s>, key: NodeKey, entry: Arc<NodeEntry>) {
        let Some(function) = self.evaluator.registry.get(key.kind()).cloned() else {
            self.state.abort(EvaluationError::ContractViolation {
                message: format!("no function registered for kind {}", key.kind()),
                key,
            });
            return;
        };
        let (requested, state, invocation) = match entry.lock().in_flight.as_mut() {
            Some(in_flight) => {
                in_flight.invocations += 1;
                (
                    std::mem::take(&mut in_flight.requested),
                    in_flight.state.take(),
                    in_flight.invocations,
                )
            }
            None => return,
        };

        let tracer = &self.evaluator.tracer;
        let span = tracer.new_span_id();
        tracer.on_node_start(span, &key);
        trace!(key = ?key, invocation, "computing");

        entry.arm();
        let mut env = Environment::new(
            &key,
            &entry,
            &self.state,
            tracer,
            &*self.evaluator.event_filter,
            span,
            requested,
            state,
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| function.compute(&key, &mut env)));
        let invocation = env.finish();
        if let Some(in_flight) = entry.lock().in_flight.as_mut() {
            in_flight.requested = invocation.requested;
            in_flight.state = invocation.state;
            if !invocation.new_group.is_empty() {
                in_flight.groups.push(invocation.new_group);
            }
        }

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(payload) => {
                self.state.abort(EvaluationError::Panicked {
                    message: panic_message(payload.as_ref()),
                    key,
                });
                return;
            }
        };

        match outcome {
            Err(ComputeError::Interrupted) => self.state.interrupt(),
            _ if invocation.interrupted => self.state.interrupt(),
            Err(ComputeError::Failed(error)) => {
                for dep in invocation.to_schedule {
                    self.spawn(scope, dep);
                }
                let error = NodeError::Computation {
                    key: key.clone(),
                    error,
                };
                self.complete(scope, key, &entry, span, Err(error), invocation.diagnostics);
            }
            // Without keep-going a failed dependency fails the requester,
            // whatever the function returned.
            Ok(_) if !self.state.keep_going && !invocation.dep_errors.is_empty() => {
                let (dep, dep_error) = &invocation.dep_errors[0];
                let error = NodeError::dependency(key.clone(), dep.clone(), dep_error);
                self.complete(scope, key, &entry, span, Err(error), invocation.diagnostics);
            }
            Ok(Some(value)) if invocation.pending == 0 => {
                self.complete(scope, key, &entry, span, Ok(value), invocation.diagnostics);
            }
            Ok(Some(_)) => self.state.abort(EvaluationError::ContractViolation {
                message: format!(
                    "returned a value while {} requested dependencies were missing",
                    invocation.pending
                ),
                key,
            }),
            Ok(None) if invocation.pending > 0 => {
                trace!(key = ?key, pending = invocation.pending, "parked");
                tracer.on_node_end(span, &key, &ExecutionResult::Parked);
                for dep in invocation.to_schedule {
                    self.spawn(scope, dep);
                }
                if entry.release_one() {
                    self.spawn(scope, key);
                }
            }
            Ok(None) => match invocation.dep_errors.into_iter().next() {
                Some((dep, dep_error)) => {
                    let error = NodeError::dependency(key.clone(), dep, &dep_error);
                    self.complete(scope, key, &entry, span, Err(error), invocation.diagnostics);
                }
                None => self.state.abort(EvaluationError::ContractViolation {
                    message: "returned no value although no dependency was missing".into(),
                    key,
                }),
            },
        }
    }

    /// Publish the result of `key` and wake everything parked on it.
    fn complete<'s>(
        &'s self,
        scope: &Scope<'s>,
        key: NodeKey,
        entry: &NodeEntry,
        span: SpanId,
        result: Result<NodeValue, NodeError>,
        diagnostics: Vec<Diagnostic>,
    ) {
        let waiters = self.publish(key, entry, span, result, diagnostics);
        self.signal(scope, waiters);
    }

    /// Store the result of `key` and return the keys parked on it.
    fn publish(
        &self,
        key: NodeKey,
        entry: &NodeEntry,
        span: SpanId,
        result: Result<NodeValue, NodeError>,
        diagnostics: Vec<Diagnostic>,
    ) -> Vec<NodeKey> {
        let tracer = &self.evaluator.tracer;
        let execution = match &result {
            Ok(_) => None,
            Err(NodeError::Cycle { .. }) => Some(ExecutionResult::CycleDetected),
            Err(error) => Some(ExecutionResult::Failed {
                message: error.to_string(),
            }),
        };
        let completion = entry
            .lock()
            .complete(result, self.state.version, diagnostics);
        self.publish_edges(&key, &completion);

        let execution = match execution {
            Some(execution) => execution,
            None => {
                tracer.on_early_cutoff_check(span, &key, completion.changed);
                if completion.changed {
                    ExecutionResult::Changed
                } else {
                    ExecutionResult::Unchanged
                }
            }
        };
        let failed = matches!(
            execution,
            ExecutionResult::Failed { .. } | ExecutionResult::CycleDetected
        );
        tracer.on_node_end(span, &key, &execution);
        if failed && !self.state.keep_going {
            debug!(key = ?key, "stopping after first failure");
            self.state.stop();
        }
        completion.waiters
    }

    /// Keep reverse dependencies in step with the new direct dependencies.
    fn publish_edges(&self, key: &NodeKey, completion: &Completion) {
        let graph = &self.state.graph;
        for dep in completion.new_deps.iter() {
            graph
                .get_or_create(dep)
                .lock()
                .reverse_deps
                .insert(key.clone());
        }
        let current: ahash::HashSet<&NodeKey> = completion.new_deps.iter().collect();
        for dep in completion.old_deps.iter() {
            if current.contains(dep) {
                continue;
            }
            if let Some(dep_entry) = graph.get(dep) {
                dep_entry.lock().reverse_deps.remove(key);
            }
        }
    }

    fn signal<'s>(&'s self, scope: &Scope<'s>, waiters: Vec<NodeKey>) {
        for waiter in waiters {
            let Some(entry) = self.state.graph.get(&waiter) else {
                continue;
            };
            if entry.release_one() {
                self.spawn(scope, waiter);
            }
        }
    }

    // ------------------------------------------------------------------------
    // After the scope drains
    // ------------------------------------------------------------------------

    /// Find cycles among the claimed nodes that are still unfinished.
    fn detect_cycles(&self) -> CycleReport {
        let pinned = self.state.claimed.pin();
        let mut stuck = ahash::HashSet::default();
        let mut waits = Vec::new();
        for (key, entry) in pinned.iter() {
            let data = entry.lock();
            if !data.is_owned_by(self.state.version) {
                continue;
            }
            stuck.insert(key.clone());
            waits.extend(data.waiters.iter().map(|w| (w.clone(), key.clone())));
        }
        if stuck.is_empty() {
            return CycleReport::default();
        }
        debug!(stuck = stuck.len(), "scope drained with unfinished nodes");
        cycle::find_cycles(waits.into_iter().filter(|(w, _)| stuck.contains(w)))
    }

    fn fail_cycles<'s>(&'s self, scope: &Scope<'s>, report: CycleReport) {
        let tracer = &self.evaluator.tracer;
        for path in &report.cycles {
            debug!(cycle = ?path, "dependency cycle detected");
            tracer.on_cycle_detected(path);
        }
        // All members fail before any waiter is woken.
        let mut waiters = Vec::new();
        for (key, path) in report.members {
            let Some(entry) = self.state.graph.get(&key) else {
                continue;
            };
            let span = tracer.new_span_id();
            tracer.on_node_start(span, &key);
            let error = NodeError::Cycle { cycle: path };
            waiters.extend(self.publish(key, &entry, span, Err(error), Vec::new()));
        }
        self.signal(scope, waiters);
    }

    fn collect(&self, roots: &[NodeKey]) -> EvaluationResult {
        let mut result = EvaluationResult::new(roots.to_vec());
        for root in roots {
            let settled = self
                .state
                .graph
                .get(root)
                .and_then(|entry| entry.lock().settled());
            match settled {
                Some(Settled { result: Ok(value), .. }) => result.insert_value(root.clone(), value),
                Some(Settled { result: Err(error), .. }) => result.insert_error(root.clone(), error),
                None => {
                    let mut visited = ahash::HashSet::default();
                    match self.failure_below(root, &mut visited) {
                        Some(error) if !self.state.keep_going => {
                            result.insert_error(root.clone(), error)
                        }
                        _ => result.insert_unfinished(root.clone()),
                    }
                }
            }
            if self.state.store_events {
                result.insert_diagnostics(root.clone(), self.transcript(root));
            }
        }
        result
    }

    /// Search the dependencies an unfinished node waits on for a failed node,
    /// and build the error chain leading there.
    fn failure_below(
        &self,
        key: &NodeKey,
        visited: &mut ahash::HashSet<NodeKey>,
    ) -> Option<NodeError> {
        let entry = self.state.graph.get(key)?;
        let deps: Vec<NodeKey> = {
            let data = entry.lock();
            match &data.in_flight {
                Some(in_flight) if in_flight.version == self.state.version => {
                    match in_flight.phase {
                        Phase::Computing => in_flight.groups.iter().flatten().cloned().collect(),
                        Phase::CheckingDeps { group } => data
                            .direct_deps
                            .group(group)
                            .map(<[NodeKey]>::to_vec)
                            .unwrap_or_default(),
                    }
                }
                _ => return None,
            }
        };
        for dep in deps {
            if !visited.insert(dep.clone()) {
                continue;
            }
            let Some(dep_entry) = self.state.graph.get(&dep) else {
                continue;
            };
            let failed = dep_entry.lock().settled().and_then(|s| s.result.err());
            if let Some(dep_error) = failed {
                return Some(NodeError::dependency(key.clone(), dep, &dep_error));
            }
            if let Some(dep_error) = self.failure_below(&dep, visited) {
                return Some(NodeError::dependency(key.clone(), dep, &dep_error));
            }
        }
        None
    }

    /// The diagnostics of `root` followed by those of every transitive
    /// dependency reached over edges the filter propagates.
    fn transcript(&self, root: &NodeKey) -> Vec<Diagnostic> {
        let graph = &self.state.graph;
        let filter = &*self.evaluator.event_filter;
        let Some(entry) = graph.get(root) else {
            return Vec::new();
        };
        let mut transcript = entry.diagnostics().to_vec();
        let mut visited = ahash::HashSet::default();
        visited.insert(root.clone());
        let mut stack = vec![(root.clone(), entry)];
        while let Some((key, entry)) = stack.pop() {
            for dep in entry.direct_deps().iter() {
                if visited.contains(dep) || !filter.should_propagate(dep, &key) {
                    continue;
                }
                visited.insert(dep.clone());
                if let Some(dep_entry) = graph.get(dep) {
                    transcript.extend(dep_entry.diagnostics().iter().cloned());
                    stack.push((dep.clone(), dep_entry));
                }
            }
        }
        transcript
    }

    /// Return every node the run still owns to its state before the run.
    fn rollback(&self) {
        let mut rolled_back = 0usize;
        for (_, entry) in self.state.claimed.pin().iter() {
            if entry.lock().rollback() {
                rolled_back += 1;
            }
        }
        if rolled_back > 0 {
            debug!(rolled_back, "rolled back unfinished nodes");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
