//! The store of node entries.

use std::sync::Arc;

use papaya::{Compute, HashMap, Operation};

use crate::entry::NodeEntry;
use crate::key::NodeKey;
use crate::version::{Version, VersionClock};

/// Thread-safe map from [`NodeKey`] to its [`NodeEntry`], plus the clock the
/// entries are versioned against.
///
/// Uses papaya's lock-free HashMap internally, so creating or looking up one
/// key never blocks on another.
pub struct InMemoryGraph {
    nodes: HashMap<NodeKey, Arc<NodeEntry>, ahash::RandomState>,
    clock: VersionClock,
}

impl Default for InMemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGraph {
    /// Create an empty graph at [`Version::ZERO`].
    pub fn new() -> Self {
        Self {
            nodes: HashMap::with_hasher(ahash::RandomState::new()),
            clock: VersionClock::new(),
        }
    }

    /// The entry for `key`, if one was ever created.
    pub fn get(&self, key: &NodeKey) -> Option<Arc<NodeEntry>> {
        self.nodes.pin().get(key).cloned()
    }

    /// The entry for `key`, created in [`NodeState::NotStarted`](crate::NodeState::NotStarted)
    /// if absent. Concurrent callers for the same key get the same entry.
    pub fn get_or_create(&self, key: &NodeKey) -> Arc<NodeEntry> {
        let pinned = self.nodes.pin();
        if let Some(entry) = pinned.get(key) {
            return entry.clone();
        }
        pinned
            .get_or_insert_with(key.clone(), || Arc::new(NodeEntry::new()))
            .clone()
    }

    /// Returns true if an entry exists for `key`.
    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.pin().contains_key(key)
    }

    /// All keys with an entry, in no particular order.
    pub fn keys(&self) -> Vec<NodeKey> {
        self.nodes.pin().keys().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no entries.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The latest version handed out by the graph's clock.
    pub fn version(&self) -> Version {
        self.clock.current()
    }

    pub(crate) fn clock(&self) -> &VersionClock {
        &self.clock
    }

    /// Remove `key` if no entry depends on it and no run owns it.
    ///
    /// The removed entry is also dropped from the reverse dependencies of
    /// everything it depended on. Returns true if the entry was removed.
    pub(crate) fn remove_if_unused(&self, key: &NodeKey) -> bool {
        let pinned = self.nodes.pin();
        let result = pinned.compute(key.clone(), |entry| {
            let Some((_, entry)) = entry else {
                return Operation::Abort(());
            };
            let data = entry.lock();
            if data.reverse_deps.is_empty() && data.in_flight.is_none() {
                Operation::Remove
            } else {
                Operation::Abort(())
            }
        });
        match result {
            Compute::Removed(_, removed) => {
                for dep in removed.direct_deps().iter() {
                    if let Some(dep_entry) = pinned.get(dep) {
                        dep_entry.lock().reverse_deps.remove(key);
                    }
                }
                true
            }
            _ => false,
        }
    }
}
