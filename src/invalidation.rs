//! Marking the graph dirty between evaluations.
//!
//! Nothing is recomputed here. Changed keys are marked
//! [`DirtyState::NeedsRebuild`] and everything that transitively depended on
//! them [`DirtyState::CheckDeps`]; the next evaluation decides what actually
//! runs again.

use std::collections::VecDeque;

use tracing::debug;

use crate::entry::{DirtyState, NodeState};
use crate::evaluator::Evaluator;
use crate::key::NodeKey;
use crate::tracer::{InvalidationReason, Tracer};
use crate::value::NodeValue;

/// Keys touched by one invalidation or injection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Keys marked for rebuild, or injected with a new value.
    pub changed: Vec<NodeKey>,
    /// Dependents marked for re-verification, in breadth-first order.
    pub dirtied: Vec<NodeKey>,
}

impl InvalidationReport {
    /// Returns true if nothing was marked.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.dirtied.is_empty()
    }
}

impl<T: Tracer> Evaluator<T> {
    /// Mark `changed` for rebuild and their transitive dependents for
    /// re-verification.
    ///
    /// Keys without a completed entry are ignored. Each entry is visited at most
    /// once per call; an already dirty dependent is not traversed again.
    pub fn invalidate(&self, changed: impl IntoIterator<Item = NodeKey>) -> InvalidationReport {
        let _session = self.session.lock();
        let mut report = InvalidationReport::default();
        let mut seen = ahash::HashSet::default();
        let mut frontier = VecDeque::new();

        for key in changed {
            if !seen.insert(key.clone()) {
                continue;
            }
            let Some(entry) = self.graph.get(&key) else {
                continue;
            };
            let dependents: Vec<NodeKey> = {
                let mut data = entry.lock();
                if !matches!(data.state, NodeState::Done | NodeState::Error) {
                    continue;
                }
                if data.mark_dirty(DirtyState::NeedsRebuild) {
                    data.reverse_deps.iter().cloned().collect()
                } else {
                    Vec::new()
                }
            };
            self.tracer
                .on_node_invalidated(&key, InvalidationReason::Changed);
            report.changed.push(key);
            frontier.extend(dependents);
        }

        self.dirty_dependents(frontier, &mut report);
        debug!(
            changed = report.changed.len(),
            dirtied = report.dirtied.len(),
            "invalidated"
        );
        report
    }

    /// Set the values of `values` directly, as if computed, and mark the
    /// dependents of every key whose value changed for re-verification.
    ///
    /// Advances the clock once. Injecting a value equal to the current one
    /// records no change. Injected keys lose their recorded dependencies.
    pub fn inject(
        &self,
        values: impl IntoIterator<Item = (NodeKey, NodeValue)>,
    ) -> InvalidationReport {
        let _session = self.session.lock();
        let version = self.graph.clock().advance();
        let mut report = InvalidationReport::default();
        let mut frontier = VecDeque::new();

        for (key, value) in values {
            let entry = self.graph.get_or_create(&key);
            let (old_deps, changed) = entry.lock().inject(value, version);
            for dep in old_deps.iter() {
                if let Some(dep_entry) = self.graph.get(dep) {
                    dep_entry.lock().reverse_deps.remove(&key);
                }
            }
            if changed {
                self.tracer
                    .on_node_invalidated(&key, InvalidationReason::Injected);
                frontier.extend(entry.reverse_deps());
                report.changed.push(key);
            }
        }

        self.dirty_dependents(frontier, &mut report);
        debug!(
            version = version.0,
            changed = report.changed.len(),
            dirtied = report.dirtied.len(),
            "injected"
        );
        report
    }

    fn dirty_dependents(&self, mut frontier: VecDeque<NodeKey>, report: &mut InvalidationReport) {
        while let Some(key) = frontier.pop_front() {
            let Some(entry) = self.graph.get(&key) else {
                continue;
            };
            let dependents: Vec<NodeKey> = {
                let mut data = entry.lock();
                if !data.mark_dirty(DirtyState::CheckDeps) {
                    continue;
                }
                data.reverse_deps.iter().cloned().collect()
            };
            self.tracer
                .on_node_invalidated(&key, InvalidationReason::DependencyDirtied);
            report.dirtied.push(key);
            frontier.extend(dependents);
        }
    }
}
