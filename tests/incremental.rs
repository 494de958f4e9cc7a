//! Tests for caching, re-verification and early cutoff.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use nodeflow::{DirtyState, Evaluator, NodeKey, NodeKind, NodeState, NodeValue};

const X: NodeKind = NodeKind::new("X");
const Y: NodeKind = NodeKind::new("Y");
const Z: NodeKind = NodeKind::new("Z");

fn x() -> NodeKey {
    NodeKey::new(X, ())
}

fn y() -> NodeKey {
    NodeKey::new(Y, ())
}

fn z() -> NodeKey {
    NodeKey::new(Z, ())
}

fn int(value: &NodeValue) -> i64 {
    *value.downcast_ref::<i64>().unwrap()
}

#[derive(Default)]
struct Counters {
    x: AtomicUsize,
    y: AtomicUsize,
    z: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> (usize, usize, usize) {
        (
            self.x.load(Ordering::SeqCst),
            self.y.load(Ordering::SeqCst),
            self.z.load(Ordering::SeqCst),
        )
    }
}

/// X reads `input`, Y = X + 1, Z = Y * 2.
fn xyz(input: Arc<AtomicI64>, counters: Arc<Counters>) -> Evaluator {
    let (cx, cy, cz) = (counters.clone(), counters.clone(), counters);
    Evaluator::builder()
        .threads(4)
        .function(X, move |_key, _env| {
            cx.x.fetch_add(1, Ordering::SeqCst);
            Ok(Some(NodeValue::new(input.load(Ordering::SeqCst))))
        })
        .function(Y, move |_key, env| {
            cy.y.fetch_add(1, Ordering::SeqCst);
            let Some(x) = env.get_value(&x()) else {
                return Ok(None);
            };
            Ok(Some(NodeValue::new(int(&x) + 1)))
        })
        .function(Z, move |_key, env| {
            cz.z.fetch_add(1, Ordering::SeqCst);
            let Some(y) = env.get_value(&y()) else {
                return Ok(None);
            };
            Ok(Some(NodeValue::new(int(&y) * 2)))
        })
        .build()
        .unwrap()
}

fn eval_z(evaluator: &Evaluator) -> i64 {
    let result = evaluator.evaluate(&[z()], false).unwrap();
    assert!(result.is_success());
    int(result.get(&z()).unwrap())
}

// =============================================================================
// X/Y/Z scenarios
// =============================================================================

#[test]
fn test_changed_input_recomputes_dependents() {
    let input = Arc::new(AtomicI64::new(1));
    let counters = Arc::new(Counters::default());
    let evaluator = xyz(input.clone(), counters.clone());

    assert_eq!(eval_z(&evaluator), 4);
    let (x0, y0, z0) = counters.snapshot();
    assert_eq!(x0, 1);

    input.store(2, Ordering::SeqCst);
    evaluator.invalidate([x()]);
    assert_eq!(eval_z(&evaluator), 6);

    // X re-runs as a leaf, Y and Z are recomputed exactly once.
    assert_eq!(counters.snapshot(), (x0 + 1, y0 + 1, z0 + 1));
}

#[test]
fn test_equal_value_cuts_off_dependents() {
    let input = Arc::new(AtomicI64::new(1));
    let counters = Arc::new(Counters::default());
    let evaluator = xyz(input, counters.clone());

    assert_eq!(eval_z(&evaluator), 4);
    let (x0, y0, z0) = counters.snapshot();
    let z_changed_at = evaluator.entry(&z()).unwrap().changed_at();

    evaluator.invalidate([x()]);
    assert_eq!(eval_z(&evaluator), 4);

    assert_eq!(counters.snapshot(), (x0 + 1, y0, z0));
    // Y and Z were revisited and verified at the new version.
    let version = evaluator.version();
    for key in [x(), y(), z()] {
        let entry = evaluator.entry(&key).unwrap();
        assert_eq!(entry.evaluated_at(), version, "{key:?}");
        assert_eq!(entry.dirty_state(), None, "{key:?}");
    }
    assert_eq!(evaluator.entry(&z()).unwrap().changed_at(), z_changed_at);
}

#[test]
fn test_unchanged_graph_runs_nothing() {
    let input = Arc::new(AtomicI64::new(1));
    let counters = Arc::new(Counters::default());
    let evaluator = xyz(input, counters.clone());

    let first = evaluator.evaluate(&[z()], false).unwrap();
    let before = counters.snapshot();
    let second = evaluator.evaluate(&[z()], false).unwrap();

    assert_eq!(counters.snapshot(), before);
    assert_eq!(first.get(&z()), second.get(&z()));
}

#[test]
fn test_intermediate_roots_share_work() {
    let input = Arc::new(AtomicI64::new(3));
    let counters = Arc::new(Counters::default());
    let evaluator = xyz(input, counters.clone());

    let result = evaluator.evaluate(&[z(), y(), x()], false).unwrap();
    assert_eq!(result.get(&x()).map(int), Some(3));
    assert_eq!(result.get(&y()).map(int), Some(4));
    assert_eq!(result.get(&z()).map(int), Some(8));
    assert_eq!(counters.x.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dirty_entries_keep_state_until_evaluated() {
    let input = Arc::new(AtomicI64::new(1));
    let counters = Arc::new(Counters::default());
    let evaluator = xyz(input, counters);

    eval_z(&evaluator);
    evaluator.invalidate([x()]);

    let z_entry = evaluator.entry(&z()).unwrap();
    assert_eq!(z_entry.state(), NodeState::Done);
    assert_eq!(z_entry.dirty_state(), Some(DirtyState::CheckDeps));
    assert!(!z_entry.is_clean());
    // Dirty values are not handed out.
    assert_eq!(evaluator.get_value(&z()), None);

    // Evaluating Y alone leaves Z dirty.
    evaluator.evaluate(&[y()], false).unwrap();
    assert_eq!(z_entry.dirty_state(), Some(DirtyState::CheckDeps));
    assert_eq!(eval_z(&evaluator), 4);
    assert!(z_entry.is_clean());
}

// =============================================================================
// Dependency bookkeeping
// =============================================================================

const LEAF: NodeKind = NodeKind::new("LEAF");
const PICK: NodeKind = NodeKind::new("PICK");
const FLAG: NodeKind = NodeKind::new("FLAG");

fn leaf(name: &'static str) -> NodeKey {
    NodeKey::new(LEAF, name)
}

fn flag() -> NodeKey {
    NodeKey::new(FLAG, ())
}

/// PICK reads FLAG first, then LEAF "a" or LEAF "b" depending on it.
fn picker(leaf_runs: Arc<AtomicUsize>) -> Evaluator {
    Evaluator::builder()
        .function(LEAF, move |key, _env| {
            leaf_runs.fetch_add(1, Ordering::SeqCst);
            let name = *key.argument::<&'static str>().unwrap();
            Ok(Some(NodeValue::new(name.to_string())))
        })
        .function(PICK, |_key, env| {
            let Some(flag) = env.get_value(&flag()) else {
                return Ok(None);
            };
            let which = if *flag.downcast_ref::<bool>().unwrap() {
                leaf("a")
            } else {
                leaf("b")
            };
            Ok(env.get_value(&which))
        })
        .build()
        .unwrap()
}

#[test]
fn test_direct_deps_record_request_groups() {
    let evaluator = picker(Arc::new(AtomicUsize::new(0)));
    evaluator.inject([(flag(), NodeValue::new(true))]);

    let pick = NodeKey::new(PICK, ());
    let result = evaluator.evaluate(&[pick.clone()], false).unwrap();
    assert_eq!(
        result.get(&pick).and_then(|v| v.downcast_ref::<String>().cloned()),
        Some("a".to_string())
    );

    // The flag was available immediately, so both requests happened in the
    // same invocation and form a single group.
    let deps = evaluator.entry(&pick).unwrap().direct_deps();
    assert_eq!(deps.groups(), &[vec![flag(), leaf("a")]]);
    assert!(!deps.contains(&leaf("b")));
    assert_eq!(evaluator.entry(&leaf("a")).unwrap().reverse_deps(), vec![pick.clone()]);
    assert!(evaluator.entry(&leaf("b")).is_none());
}

const SOURCE: NodeKind = NodeKind::new("SOURCE");

/// Like `picker`, but FLAG is computed from SOURCE, which reads `source`.
fn computed_picker(leaf_runs: Arc<AtomicUsize>, source: Arc<AtomicBool>) -> Evaluator {
    let base = picker(leaf_runs);
    Evaluator::builder()
        .registry(base.registry().clone())
        .function(FLAG, |_key, env| Ok(env.get_value(&NodeKey::new(SOURCE, ()))))
        .function(SOURCE, move |_key, _env| {
            Ok(Some(NodeValue::new(source.load(Ordering::SeqCst))))
        })
        .build()
        .unwrap()
}

#[test]
fn test_groups_follow_restarts() {
    let evaluator = computed_picker(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicBool::new(false)));

    let pick = NodeKey::new(PICK, ());
    evaluator.evaluate(&[pick.clone()], false).unwrap();
    // The flag had to be computed first, so the leaf was requested in a
    // second invocation.
    let deps = evaluator.entry(&pick).unwrap().direct_deps();
    assert_eq!(deps.groups(), &[vec![flag()], vec![leaf("b")]]);
    assert_eq!(deps.len(), 2);
}

#[test]
fn test_dropped_dependency_loses_reverse_edge() {
    let leaf_runs = Arc::new(AtomicUsize::new(0));
    let evaluator = picker(leaf_runs.clone());
    let pick = NodeKey::new(PICK, ());

    evaluator.inject([(flag(), NodeValue::new(true))]);
    evaluator.evaluate(&[pick.clone()], false).unwrap();

    let report = evaluator.inject([(flag(), NodeValue::new(false))]);
    assert_eq!(report.changed, vec![flag()]);
    assert_eq!(report.dirtied, vec![pick.clone()]);

    let result = evaluator.evaluate(&[pick.clone()], false).unwrap();
    assert_eq!(
        result.get(&pick).and_then(|v| v.downcast_ref::<String>().cloned()),
        Some("b".to_string())
    );
    assert!(evaluator.entry(&leaf("a")).unwrap().reverse_deps().is_empty());
    assert_eq!(evaluator.entry(&leaf("b")).unwrap().reverse_deps(), vec![pick]);
    assert_eq!(leaf_runs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_check_deps_stops_at_first_changed_group() {
    let leaf_runs = Arc::new(AtomicUsize::new(0));
    let source = Arc::new(AtomicBool::new(false));
    let evaluator = computed_picker(leaf_runs.clone(), source.clone());
    let pick = NodeKey::new(PICK, ());
    evaluator.evaluate(&[pick.clone()], false).unwrap();
    assert_eq!(leaf_runs.load(Ordering::SeqCst), 1);

    // Both the flag source and the old second-group leaf change. Once the
    // first group is found changed, the old leaf is never brought up to date.
    source.store(true, Ordering::SeqCst);
    evaluator.invalidate([NodeKey::new(SOURCE, ()), leaf("b")]);
    let result = evaluator.evaluate(&[pick.clone()], false).unwrap();
    assert_eq!(
        result.get(&pick).and_then(|v| v.downcast_ref::<String>().cloned()),
        Some("a".to_string())
    );

    let b = evaluator.entry(&leaf("b")).unwrap();
    assert_eq!(b.dirty_state(), Some(DirtyState::NeedsRebuild));
    assert!(b.reverse_deps().is_empty());
    assert_eq!(leaf_runs.load(Ordering::SeqCst), 2);
}
