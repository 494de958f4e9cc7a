//! Per-key node records and their lifecycle.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::diagnostic::Diagnostic;
use crate::error::NodeError;
use crate::key::NodeKey;
use crate::value::NodeValue;
use crate::version::Version;

/// Lifecycle state of a [`NodeEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Created but never computed.
    NotStarted,
    /// Owned by a running evaluation, possibly suspended on a dependency group.
    WaitingForDeps,
    /// Computed successfully.
    Done,
    /// Computation failed.
    Error,
}

/// Why a completed entry must be looked at again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirtyState {
    /// Some dependency may have changed. Re-verify before recomputing.
    CheckDeps,
    /// The entry itself changed and must be recomputed.
    NeedsRebuild,
}

/// Dependencies of an entry, grouped by the round in which they were requested.
///
/// Clone is cheap as the groups are wrapped by `Arc`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupedDeps(Arc<Vec<Vec<NodeKey>>>);

impl GroupedDeps {
    /// New dependencies from a list of groups. Empty groups are dropped.
    pub fn new(groups: Vec<Vec<NodeKey>>) -> Self {
        GroupedDeps(Arc::new(
            groups.into_iter().filter(|g| !g.is_empty()).collect(),
        ))
    }

    /// All groups, in request order.
    pub fn groups(&self) -> &[Vec<NodeKey>] {
        &self.0
    }

    /// The group at `index`.
    pub fn group(&self, index: usize) -> Option<&[NodeKey]> {
        self.0.get(index).map(Vec::as_slice)
    }

    /// Number of groups.
    pub fn group_count(&self) -> usize {
        self.0.len()
    }

    /// Total number of dependencies.
    pub fn len(&self) -> usize {
        self.0.iter().map(Vec::len).sum()
    }

    /// Returns true if there are no dependencies.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if `key` is a dependency in any group.
    pub fn contains(&self, key: &NodeKey) -> bool {
        self.iter().any(|k| k == key)
    }

    /// Iterate over all dependencies, group by group.
    pub fn iter(&self) -> impl Iterator<Item = &NodeKey> + '_ {
        self.0.iter().flatten()
    }
}

impl FromIterator<Vec<NodeKey>> for GroupedDeps {
    fn from_iter<T: IntoIterator<Item = Vec<NodeKey>>>(iter: T) -> Self {
        GroupedDeps::new(iter.into_iter().collect())
    }
}

/// What a claimed entry is doing in the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Re-verifying the recorded dependency groups, starting at `group`.
    CheckingDeps { group: usize },
    /// Running the computation function.
    Computing,
}

/// Bookkeeping of an entry owned by a running evaluation.
pub(crate) struct InFlight {
    pub(crate) version: Version,
    pub(crate) phase: Phase,
    prior_state: NodeState,
    prior_dirty: Option<DirtyState>,
    /// Groups requested by the computation so far in this run.
    pub(crate) groups: Vec<Vec<NodeKey>>,
    pub(crate) requested: ahash::HashSet<NodeKey>,
    /// Continuation object kept across restarts.
    pub(crate) state: Option<Box<dyn Any + Send>>,
    pub(crate) invocations: u32,
}

/// The settled result of an up-to-date entry.
#[derive(Debug, Clone)]
pub(crate) struct Settled {
    pub(crate) result: Result<NodeValue, NodeError>,
    pub(crate) changed_at: Version,
}

/// What completing an entry changed, for the caller to act on outside the lock.
pub(crate) struct Completion {
    pub(crate) waiters: Vec<NodeKey>,
    pub(crate) old_deps: GroupedDeps,
    pub(crate) new_deps: GroupedDeps,
    pub(crate) changed: bool,
}

pub(crate) struct EntryData {
    pub(crate) state: NodeState,
    pub(crate) value: Option<NodeValue>,
    pub(crate) error: Option<NodeError>,
    pub(crate) direct_deps: GroupedDeps,
    pub(crate) reverse_deps: ahash::HashSet<NodeKey>,
    pub(crate) dirty: Option<DirtyState>,
    pub(crate) diagnostics: Arc<[Diagnostic]>,
    pub(crate) evaluated_at: Version,
    pub(crate) changed_at: Version,
    pub(crate) in_flight: Option<InFlight>,
    /// Keys parked until this entry settles.
    pub(crate) waiters: Vec<NodeKey>,
}

impl EntryData {
    fn new() -> Self {
        Self {
            state: NodeState::NotStarted,
            value: None,
            error: None,
            direct_deps: GroupedDeps::default(),
            reverse_deps: Default::default(),
            dirty: None,
            diagnostics: Arc::from(Vec::new()),
            evaluated_at: Version::ZERO,
            changed_at: Version::ZERO,
            in_flight: None,
            waiters: Vec::new(),
        }
    }

    /// The result of the entry if it is completed, clean and not owned by a run.
    pub(crate) fn settled(&self) -> Option<Settled> {
        if self.in_flight.is_some() || self.dirty.is_some() {
            return None;
        }
        let result = match (self.state, &self.value, &self.error) {
            (NodeState::Done, Some(value), _) => Ok(value.clone()),
            (NodeState::Error, _, Some(error)) => Err(error.clone()),
            _ => return None,
        };
        Some(Settled {
            result,
            changed_at: self.changed_at,
        })
    }

    /// Make the run at `version` the owner of this entry.
    ///
    /// Returns false if the entry is already owned or has nothing to do.
    pub(crate) fn claim(&mut self, version: Version) -> bool {
        if self.in_flight.is_some() || self.settled().is_some() {
            return false;
        }
        let phase = match self.dirty {
            Some(DirtyState::CheckDeps) => Phase::CheckingDeps { group: 0 },
            Some(DirtyState::NeedsRebuild) | None => Phase::Computing,
        };
        self.in_flight = Some(InFlight {
            version,
            phase,
            prior_state: self.state,
            prior_dirty: self.dirty,
            groups: Vec::new(),
            requested: Default::default(),
            state: None,
            invocations: 0,
        });
        self.state = NodeState::WaitingForDeps;
        true
    }

    /// Returns true if the entry is owned by the run at `version`.
    pub(crate) fn is_owned_by(&self, version: Version) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.version == version)
    }

    /// Mark a completed entry dirty.
    ///
    /// Returns true only when a clean entry became dirty, meaning its
    /// dependents have not been visited yet.
    pub(crate) fn mark_dirty(&mut self, dirty: DirtyState) -> bool {
        if !matches!(self.state, NodeState::Done | NodeState::Error) {
            return false;
        }
        match self.dirty {
            None => {
                self.dirty = Some(dirty);
                true
            }
            Some(DirtyState::CheckDeps) if dirty == DirtyState::NeedsRebuild => {
                self.dirty = Some(dirty);
                false
            }
            Some(_) => false,
        }
    }

    /// Publish the result of the run at `version`.
    ///
    /// A successful result equal to the previous value keeps `changed_at`, so
    /// dependents re-verifying against this entry see no change.
    pub(crate) fn complete(
        &mut self,
        result: Result<NodeValue, NodeError>,
        version: Version,
        diagnostics: Vec<Diagnostic>,
    ) -> Completion {
        let in_flight = self.in_flight.take();
        let prior_state = in_flight.as_ref().map_or(self.state, |f| f.prior_state);
        let old_deps = self.direct_deps.clone();
        let new_deps = match in_flight {
            Some(f) if f.phase == Phase::Computing => GroupedDeps::new(f.groups),
            _ => old_deps.clone(),
        };

        let unchanged = matches!(
            (&result, prior_state, &self.value),
            (Ok(new), NodeState::Done, Some(old)) if old == new
        );
        match result {
            Ok(value) => {
                // Equal values keep the stored Arc.
                if !unchanged {
                    self.value = Some(value);
                }
                self.error = None;
                self.state = NodeState::Done;
            }
            Err(error) => {
                self.value = None;
                self.error = Some(error);
                self.state = NodeState::Error;
            }
        }
        if !unchanged {
            self.changed_at = version;
        }
        self.evaluated_at = version;
        self.dirty = None;
        self.direct_deps = new_deps.clone();
        self.diagnostics = Arc::from(diagnostics);

        Completion {
            waiters: std::mem::take(&mut self.waiters),
            old_deps,
            new_deps,
            changed: !unchanged,
        }
    }

    /// Finish a dirty entry whose dependencies all turned out unchanged.
    ///
    /// The previous result and diagnostics stay; only `evaluated_at` moves.
    pub(crate) fn mark_clean(&mut self, version: Version) -> Vec<NodeKey> {
        if let Some(in_flight) = self.in_flight.take() {
            self.state = in_flight.prior_state;
        }
        self.dirty = None;
        self.evaluated_at = version;
        std::mem::take(&mut self.waiters)
    }

    /// Undo an unfinished claim, restoring the state before the run.
    ///
    /// Returns true if the entry was in flight.
    pub(crate) fn rollback(&mut self) -> bool {
        self.waiters.clear();
        match self.in_flight.take() {
            Some(in_flight) => {
                self.state = in_flight.prior_state;
                self.dirty = in_flight.prior_dirty;
                true
            }
            None => false,
        }
    }

    /// Overwrite the entry with an externally supplied value.
    ///
    /// Returns the previous dependencies and whether the value changed.
    pub(crate) fn inject(&mut self, value: NodeValue, version: Version) -> (GroupedDeps, bool) {
        let unchanged = self.state == NodeState::Done && self.value.as_ref() == Some(&value);
        if !unchanged {
            self.value = Some(value);
            self.changed_at = version;
        }
        self.state = NodeState::Done;
        self.error = None;
        self.dirty = None;
        self.evaluated_at = version;
        self.diagnostics = Arc::from(Vec::new());
        (std::mem::take(&mut self.direct_deps), !unchanged)
    }
}

/// The record the graph keeps for one key.
///
/// All state sits behind a single lock. The accessors below take it briefly
/// and return owned snapshots.
pub struct NodeEntry {
    data: Mutex<EntryData>,
    /// Dependencies the parked computation is still waiting for, plus one
    /// guard count held while the computation itself is running.
    pending: AtomicUsize,
}

impl Default for NodeEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeEntry {
    /// A fresh entry in [`NodeState::NotStarted`].
    pub fn new() -> Self {
        Self {
            data: Mutex::new(EntryData::new()),
            pending: AtomicUsize::new(0),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryData> {
        self.data.lock()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        self.data.lock().state
    }

    /// The value, if the entry is done and clean.
    pub fn value(&self) -> Option<NodeValue> {
        self.data.lock().settled()?.result.ok()
    }

    /// The recorded error, if the entry failed and is clean.
    pub fn error(&self) -> Option<NodeError> {
        self.data.lock().settled()?.result.err()
    }

    /// Dependencies recorded by the last completed computation.
    pub fn direct_deps(&self) -> GroupedDeps {
        self.data.lock().direct_deps.clone()
    }

    /// Keys whose last computation depended on this one.
    pub fn reverse_deps(&self) -> Vec<NodeKey> {
        self.data.lock().reverse_deps.iter().cloned().collect()
    }

    /// Pending re-check or rebuild, if any.
    pub fn dirty_state(&self) -> Option<DirtyState> {
        self.data.lock().dirty
    }

    /// Returns true if the entry is complete and needs no work.
    pub fn is_clean(&self) -> bool {
        self.data.lock().settled().is_some()
    }

    /// Diagnostics stored by the last computation.
    pub fn diagnostics(&self) -> Arc<[Diagnostic]> {
        self.data.lock().diagnostics.clone()
    }

    /// Version of the run that last computed or verified this entry.
    pub fn evaluated_at(&self) -> Version {
        self.data.lock().evaluated_at
    }

    /// Version at which the result last changed.
    pub fn changed_at(&self) -> Version {
        self.data.lock().changed_at
    }

    /// Reset the pending count to the single guard held by the running task.
    pub(crate) fn arm(&self) {
        self.pending.store(1, Ordering::SeqCst);
    }

    /// Count one more dependency the computation is waiting for.
    pub(crate) fn add_pending(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one count. Returns true for the call that reached zero.
    pub(crate) fn release_one(&self) -> bool {
        self.pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok_and(|previous| previous == 1)
    }
}

impl std::fmt::Debug for NodeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.data.lock();
        f.debug_struct("NodeEntry")
            .field("state", &data.state)
            .field("dirty", &data.dirty)
            .field("value", &data.value)
            .field("error", &data.error)
            .field("direct_deps", &data.direct_deps)
            .field("evaluated_at", &data.evaluated_at)
            .field("changed_at", &data.changed_at)
            .finish()
    }
}
