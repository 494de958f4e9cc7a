//! Computation functions and the environment they run in.

use std::any::Any;
use std::sync::Arc;

use crate::diagnostic::{Diagnostic, EventFilter};
use crate::entry::NodeEntry;
use crate::error::{ComputeError, NodeError};
use crate::evaluator::{DepLookup, RunState};
use crate::key::{NodeKey, NodeKind};
use crate::tracer::{SpanId, Tracer};
use crate::value::NodeValue;

/// What a computation returns.
///
/// - `Ok(Some(value))`: the node is done.
/// - `Ok(None)`: some requested dependency is not available yet. The function
///   is invoked again once every dependency it requested has settled.
/// - `Err(ComputeError::Failed(_))`: the node failed.
/// - `Err(ComputeError::Interrupted)`: the function observed cancellation.
pub type ComputeResult = Result<Option<NodeValue>, ComputeError>;

/// Computes the value of every key of one [`NodeKind`].
///
/// A function may be invoked several times for one key in a single
/// evaluation: every invocation after the first sees the values of the
/// dependencies that were missing before. It must be deterministic given the
/// values it reads, and must request every dependency it reads through the
/// [`Environment`].
///
/// Closures with the matching signature implement this trait.
pub trait NodeFunction: Send + Sync + 'static {
    /// Compute the value of `key`.
    fn compute(&self, key: &NodeKey, env: &mut Environment<'_>) -> ComputeResult;
}

impl<F> NodeFunction for F
where
    F: Fn(&NodeKey, &mut Environment<'_>) -> ComputeResult + Send + Sync + 'static,
{
    fn compute(&self, key: &NodeKey, env: &mut Environment<'_>) -> ComputeResult {
        self(key, env)
    }
}

/// Maps each [`NodeKind`] to the function computing it.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: ahash::HashMap<NodeKind, Arc<dyn NodeFunction>>,
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure for `kind`, replacing any previous one.
    pub fn register<F>(&mut self, kind: NodeKind, function: F) -> &mut Self
    where
        F: Fn(&NodeKey, &mut Environment<'_>) -> ComputeResult + Send + Sync + 'static,
    {
        self.register_function(kind, function)
    }

    /// Register a [`NodeFunction`] for `kind`, replacing any previous one.
    pub fn register_function(&mut self, kind: NodeKind, function: impl NodeFunction) -> &mut Self {
        self.functions.insert(kind, Arc::new(function));
        self
    }

    /// The function registered for `kind`.
    pub fn get(&self, kind: NodeKind) -> Option<&Arc<dyn NodeFunction>> {
        self.functions.get(&kind)
    }

    /// Returns true if a function is registered for `kind`.
    pub fn contains(&self, kind: NodeKind) -> bool {
        self.functions.contains_key(&kind)
    }

    /// Registered kinds, in no particular order.
    pub fn kinds(&self) -> impl Iterator<Item = NodeKind> + '_ {
        self.functions.keys().copied()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.functions.keys()).finish()
    }
}

/// Handle a computation uses to read dependencies, report diagnostics and keep
/// state across restarts.
///
/// Every dependency requested during one invocation forms one group. A group
/// is resolved as a whole before the function runs again, and groups are
/// recorded in order on the node so a later re-verification walks them the
/// same way.
pub struct Environment<'r> {
    key: &'r NodeKey,
    entry: &'r Arc<NodeEntry>,
    run: &'r RunState,
    tracer: &'r dyn Tracer,
    filter: &'r dyn EventFilter,
    span: SpanId,
    requested: ahash::HashSet<NodeKey>,
    new_group: Vec<NodeKey>,
    to_schedule: Vec<NodeKey>,
    pending: usize,
    dep_errors: Vec<(NodeKey, NodeError)>,
    diagnostics: Option<Vec<Diagnostic>>,
    state: Option<Box<dyn Any + Send>>,
    interrupted: bool,
}

/// What one invocation left behind, taken apart by the evaluator.
pub(crate) struct Invocation {
    pub(crate) requested: ahash::HashSet<NodeKey>,
    pub(crate) new_group: Vec<NodeKey>,
    pub(crate) to_schedule: Vec<NodeKey>,
    pub(crate) pending: usize,
    pub(crate) dep_errors: Vec<(NodeKey, NodeError)>,
    pub(crate) diagnostics: Vec<Diagnostic>,
    pub(crate) state: Option<Box<dyn Any + Send>>,
    pub(crate) interrupted: bool,
}

impl<'r> Environment<'r> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: &'r NodeKey,
        entry: &'r Arc<NodeEntry>,
        run: &'r RunState,
        tracer: &'r dyn Tracer,
        filter: &'r dyn EventFilter,
        span: SpanId,
        requested: ahash::HashSet<NodeKey>,
        state: Option<Box<dyn Any + Send>>,
    ) -> Self {
        Self {
            key,
            entry,
            run,
            tracer,
            filter,
            span,
            requested,
            new_group: Vec::new(),
            to_schedule: Vec::new(),
            pending: 0,
            dep_errors: Vec::new(),
            diagnostics: run.stores_events().then(Vec::new),
            state,
            interrupted: false,
        }
    }

    pub(crate) fn finish(self) -> Invocation {
        Invocation {
            requested: self.requested,
            new_group: self.new_group,
            to_schedule: self.to_schedule,
            pending: self.pending,
            dep_errors: self.dep_errors,
            diagnostics: self.diagnostics.unwrap_or_default(),
            state: self.state,
            interrupted: self.interrupted,
        }
    }

    /// The key being computed.
    pub fn key(&self) -> &NodeKey {
        self.key
    }

    /// The value of `dep`, or `None` if it is not available yet or failed.
    ///
    /// After `None` the function should return `Ok(None)` once it has
    /// requested everything else it can.
    pub fn get_value(&mut self, dep: &NodeKey) -> Option<NodeValue> {
        self.lookup(dep)?.ok()
    }

    /// Request several dependencies at once. Their values come back in order.
    pub fn get_values(&mut self, deps: &[NodeKey]) -> Vec<Option<NodeValue>> {
        deps.iter().map(|dep| self.get_value(dep)).collect()
    }

    /// The result of `dep`, including its error, or `None` if it is not
    /// available yet.
    ///
    /// Use this to recover from a dependency failure. Recovery only takes
    /// effect in keep-going evaluations; otherwise the node fails with a
    /// [`NodeError::Dependency`] whatever the function returns.
    pub fn get_result(&mut self, dep: &NodeKey) -> Option<Result<NodeValue, NodeError>> {
        self.lookup(dep)
    }

    /// Returns true if some dependency requested in this invocation is not
    /// available yet.
    pub fn values_missing(&self) -> bool {
        self.pending > 0 || self.interrupted
    }

    /// Report a diagnostic. It is stored on the node if the evaluator's
    /// [`EventFilter`] accepts it.
    pub fn report(&mut self, mut diagnostic: Diagnostic) {
        if let Some(buffer) = self.diagnostics.as_mut() {
            if self.filter.accepts(&diagnostic) {
                diagnostic.origin = Some(self.key.clone());
                buffer.push(diagnostic);
            }
        }
    }

    /// Continuation state of this computation, created with `S::default()` on
    /// first use and kept across restarts within one evaluation.
    ///
    /// If the previous invocation stored a different type, it is replaced.
    pub fn state<S: Default + Send + 'static>(&mut self) -> &mut S {
        let boxed: Box<S> = match self.state.take() {
            Some(state) => state.downcast::<S>().unwrap_or_default(),
            None => Box::default(),
        };
        self.state
            .insert(boxed)
            .downcast_mut::<S>()
            .expect("continuation state was just stored as S")
    }

    /// Returns true if the evaluation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.run.is_cancelled()
    }

    /// Return `Err(ComputeError::Interrupted)` if the evaluation was
    /// cancelled. Use it with `?` inside long computations.
    pub fn check_cancelled(&mut self) -> Result<(), ComputeError> {
        if self.run.is_cancelled() {
            self.interrupted = true;
            return Err(ComputeError::Interrupted);
        }
        Ok(())
    }

    fn lookup(&mut self, dep: &NodeKey) -> Option<Result<NodeValue, NodeError>> {
        if self.interrupted || self.run.is_cancelled() {
            self.interrupted = true;
            return None;
        }
        if self.requested.insert(dep.clone()) {
            self.new_group.push(dep.clone());
            self.tracer
                .on_dependency_registered(self.span, self.key, dep);
        }
        match self.run.request(self.key, self.entry, dep) {
            DepLookup::Ready(settled) => {
                if let Err(error) = &settled.result {
                    self.dep_errors.push((dep.clone(), error.clone()));
                }
                Some(settled.result)
            }
            DepLookup::Pending { claimed } => {
                self.pending += 1;
                if claimed {
                    self.to_schedule.push(dep.clone());
                }
                None
            }
        }
    }
}
