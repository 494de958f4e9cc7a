//! Tests for invalidation, injection, removal and tracer events.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use nodeflow::{
    DirtyState, Evaluator, EvaluatorBuilder, ExecutionResult, InvalidationReason, NodeKey,
    NodeKind, NodeState, NodeValue, SpanId, Tracer, Version,
};

const INPUT: NodeKind = NodeKind::new("INPUT");
const PLUS: NodeKind = NodeKind::new("PLUS");
const TIMES: NodeKind = NodeKind::new("TIMES");

fn input() -> NodeKey {
    NodeKey::new(INPUT, ())
}

fn plus() -> NodeKey {
    NodeKey::new(PLUS, ())
}

fn times() -> NodeKey {
    NodeKey::new(TIMES, ())
}

fn int(value: &NodeValue) -> i64 {
    *value.downcast_ref::<i64>().unwrap()
}

/// INPUT reads `source`, PLUS = INPUT + 1, TIMES = PLUS * 2. `runs` counts
/// invocations of INPUT and PLUS.
fn arithmetic(source: Arc<AtomicI64>, runs: Arc<[AtomicUsize; 2]>) -> EvaluatorBuilder {
    let plus_runs = runs.clone();
    Evaluator::builder()
        .function(INPUT, move |_key, _env| {
            runs[0].fetch_add(1, Ordering::SeqCst);
            Ok(Some(NodeValue::new(source.load(Ordering::SeqCst))))
        })
        .function(PLUS, move |_key, env| {
            plus_runs[1].fetch_add(1, Ordering::SeqCst);
            let Some(value) = env.get_value(&input()) else {
                return Ok(None);
            };
            Ok(Some(NodeValue::new(int(&value) + 1)))
        })
        .function(TIMES, |_key, env| {
            let Some(value) = env.get_value(&plus()) else {
                return Ok(None);
            };
            Ok(Some(NodeValue::new(int(&value) * 2)))
        })
}

fn counters() -> Arc<[AtomicUsize; 2]> {
    Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)])
}

fn eval_times<T: Tracer>(evaluator: &Evaluator<T>) -> i64 {
    let result = evaluator.evaluate(&[times()], false).unwrap();
    int(result.get(&times()).unwrap())
}

// =============================================================================
// Invalidation
// =============================================================================

#[test]
fn test_invalidation_report_is_breadth_first() {
    let evaluator = arithmetic(Arc::new(AtomicI64::new(1)), counters())
        .build()
        .unwrap();
    eval_times(&evaluator);
    let version = evaluator.version();

    let report = evaluator.invalidate([input()]);
    assert_eq!(report.changed, vec![input()]);
    assert_eq!(report.dirtied, vec![plus(), times()]);
    // Invalidation does not advance the clock.
    assert_eq!(evaluator.version(), version);

    let input_entry = evaluator.entry(&input()).unwrap();
    assert_eq!(input_entry.dirty_state(), Some(DirtyState::NeedsRebuild));
    assert_eq!(input_entry.state(), NodeState::Done);
    assert_eq!(
        evaluator.entry(&times()).unwrap().dirty_state(),
        Some(DirtyState::CheckDeps)
    );

    // Dependents already dirty are not walked again.
    let again = evaluator.invalidate([input()]);
    assert!(again.dirtied.is_empty());
}

#[test]
fn test_invalidating_unknown_or_unfinished_keys_is_a_no_op() {
    let evaluator = arithmetic(Arc::new(AtomicI64::new(1)), counters())
        .build()
        .unwrap();
    assert!(evaluator.invalidate([input()]).is_empty());

    eval_times(&evaluator);
    let report = evaluator.invalidate([NodeKey::new(INPUT, "other")]);
    assert!(report.is_empty());
}

#[test]
fn test_check_deps_upgrades_to_rebuild() {
    let runs = counters();
    let evaluator = arithmetic(Arc::new(AtomicI64::new(1)), runs.clone())
        .build()
        .unwrap();
    eval_times(&evaluator);

    evaluator.invalidate([input()]);
    // PLUS is already dirty, so nothing new is reached from it.
    let report = evaluator.invalidate([plus()]);
    assert_eq!(report.changed, vec![plus()]);
    assert!(report.dirtied.is_empty());
    assert_eq!(
        evaluator.entry(&plus()).unwrap().dirty_state(),
        Some(DirtyState::NeedsRebuild)
    );

    assert_eq!(eval_times(&evaluator), 4);
    // PLUS ran again although INPUT came out unchanged.
    // Each PLUS computation parks once on INPUT before finishing.
    assert_eq!(runs[0].load(Ordering::SeqCst), 2);
    assert_eq!(runs[1].load(Ordering::SeqCst), 4);
}

// =============================================================================
// Injection
// =============================================================================

#[test]
fn test_injected_value_is_used_without_computing() {
    let runs = counters();
    let evaluator = arithmetic(Arc::new(AtomicI64::new(1)), runs.clone())
        .build()
        .unwrap();

    let before = evaluator.version();
    let report = evaluator.inject([(input(), NodeValue::new(10i64))]);
    assert_eq!(report.changed, vec![input()]);
    assert!(report.dirtied.is_empty());
    assert!(evaluator.version() > before);

    assert_eq!(eval_times(&evaluator), 22);
    assert_eq!(runs[0].load(Ordering::SeqCst), 0);
    assert_eq!(evaluator.get_value(&input()), Some(NodeValue::new(10i64)));

    let report = evaluator.inject([(input(), NodeValue::new(20i64))]);
    assert_eq!(report.dirtied, vec![plus(), times()]);
    assert_eq!(eval_times(&evaluator), 42);
    assert_eq!(runs[0].load(Ordering::SeqCst), 0);
}

#[test]
fn test_injecting_equal_value_changes_nothing() {
    let evaluator = arithmetic(Arc::new(AtomicI64::new(1)), counters())
        .build()
        .unwrap();
    eval_times(&evaluator);
    let changed_at = evaluator.entry(&input()).unwrap().changed_at();

    let report = evaluator.inject([(input(), NodeValue::new(1i64))]);
    assert!(report.is_empty());
    assert_eq!(evaluator.entry(&input()).unwrap().changed_at(), changed_at);
    assert!(evaluator.entry(&times()).unwrap().is_clean());
}

#[test]
fn test_injecting_over_computed_node_drops_its_edges() {
    let runs = counters();
    let evaluator = arithmetic(Arc::new(AtomicI64::new(1)), runs.clone())
        .build()
        .unwrap();
    eval_times(&evaluator);

    let report = evaluator.inject([(plus(), NodeValue::new(100i64))]);
    assert_eq!(report.changed, vec![plus()]);
    assert_eq!(report.dirtied, vec![times()]);
    assert!(evaluator.entry(&plus()).unwrap().direct_deps().is_empty());
    assert!(evaluator.entry(&input()).unwrap().reverse_deps().is_empty());

    // INPUT changes no longer reach PLUS.
    let report = evaluator.invalidate([input()]);
    assert!(report.dirtied.is_empty());
    assert_eq!(eval_times(&evaluator), 200);
    assert_eq!(runs[1].load(Ordering::SeqCst), 2);
}

// =============================================================================
// Removal
// =============================================================================

#[test]
fn test_remove_if_unused_goes_top_down() {
    let evaluator = arithmetic(Arc::new(AtomicI64::new(1)), counters())
        .build()
        .unwrap();
    eval_times(&evaluator);
    assert_eq!(evaluator.graph().len(), 3);

    assert!(!evaluator.remove_if_unused(&input()));
    assert!(!evaluator.remove_if_unused(&plus()));
    assert!(evaluator.remove_if_unused(&times()));
    assert!(evaluator.entry(&plus()).unwrap().reverse_deps().is_empty());
    assert!(evaluator.remove_if_unused(&plus()));
    assert!(evaluator.remove_if_unused(&input()));
    assert!(evaluator.graph().is_empty());
    assert!(!evaluator.remove_if_unused(&input()));
}

#[test]
fn test_removed_nodes_are_computed_again() {
    let runs = counters();
    let evaluator = arithmetic(Arc::new(AtomicI64::new(1)), runs.clone())
        .build()
        .unwrap();
    eval_times(&evaluator);
    assert!(evaluator.remove_if_unused(&times()));

    assert_eq!(eval_times(&evaluator), 4);
    // Only TIMES was missing.
    assert_eq!(runs[1].load(Ordering::SeqCst), 2);
    assert_eq!(evaluator.entry(&plus()).unwrap().reverse_deps(), vec![times()]);
}

// =============================================================================
// Tracer events
// =============================================================================

#[derive(Default)]
struct RecordingTracer {
    next_span: AtomicU64,
    ended: Mutex<Vec<(NodeKey, ExecutionResult)>>,
    invalidated: Mutex<Vec<(NodeKey, InvalidationReason)>>,
    registered: Mutex<Vec<(NodeKey, NodeKey)>>,
}

impl RecordingTracer {
    fn ended_with(&self, key: &NodeKey) -> Vec<ExecutionResult> {
        self.ended
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, result)| result.clone())
            .collect()
    }

    fn clear(&self) {
        self.ended.lock().clear();
        self.invalidated.lock().clear();
        self.registered.lock().clear();
    }
}

impl Tracer for RecordingTracer {
    fn new_span_id(&self) -> SpanId {
        SpanId(self.next_span.fetch_add(1, Ordering::Relaxed))
    }

    fn on_node_end(&self, _span_id: SpanId, key: &NodeKey, result: &ExecutionResult) {
        self.ended.lock().push((key.clone(), result.clone()));
    }

    fn on_dependency_registered(&self, _span_id: SpanId, parent: &NodeKey, dependency: &NodeKey) {
        self.registered.lock().push((parent.clone(), dependency.clone()));
    }

    fn on_node_invalidated(&self, key: &NodeKey, reason: InvalidationReason) {
        self.invalidated.lock().push((key.clone(), reason));
    }
}

#[test]
fn test_tracer_sees_cutoff_and_verification() {
    let evaluator = arithmetic(Arc::new(AtomicI64::new(1)), counters())
        .tracer(RecordingTracer::default())
        .build()
        .unwrap();
    let tracer = evaluator.tracer();

    eval_times(&evaluator);
    assert!(tracer.ended_with(&times()).contains(&ExecutionResult::Changed));
    let registered = tracer.registered.lock().clone();
    assert!(registered.contains(&(times(), plus())));
    assert!(registered.contains(&(plus(), input())));
    tracer.clear();

    evaluator.invalidate([input()]);
    assert_eq!(
        tracer.invalidated.lock().clone(),
        vec![
            (input(), InvalidationReason::Changed),
            (plus(), InvalidationReason::DependencyDirtied),
            (times(), InvalidationReason::DependencyDirtied),
        ]
    );

    assert_eq!(eval_times(&evaluator), 4);
    assert_eq!(tracer.ended_with(&input()), vec![ExecutionResult::Unchanged]);
    for key in [plus(), times()] {
        let results = tracer.ended_with(&key);
        assert_eq!(results.last(), Some(&ExecutionResult::Verified), "{key:?}");
        assert!(!results.contains(&ExecutionResult::Changed), "{key:?}");
    }
}

#[test]
fn test_tracer_sees_dependency_change() {
    let source = Arc::new(AtomicI64::new(1));
    let evaluator = arithmetic(source.clone(), counters())
        .tracer(RecordingTracer::default())
        .build()
        .unwrap();
    let tracer = evaluator.tracer();
    eval_times(&evaluator);
    tracer.clear();

    source.store(5, Ordering::SeqCst);
    evaluator.invalidate([input()]);
    assert_eq!(eval_times(&evaluator), 12);

    assert_eq!(tracer.ended_with(&input()), vec![ExecutionResult::Changed]);
    let plus_results = tracer.ended_with(&plus());
    assert!(plus_results.contains(&ExecutionResult::DependencyChanged));
    assert_eq!(plus_results.last(), Some(&ExecutionResult::Changed));
    assert!(evaluator.version() > Version::ZERO);
}
