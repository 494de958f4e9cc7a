//! Logical clock shared by every node of a graph.

use std::sync::atomic::{AtomicU64, Ordering};

/// Logical clock value. Advanced once per evaluation run and once per injection.
///
/// Entries record the version at which they were last verified and the version
/// at which their result last actually changed; comparing the two across an
/// edge is how a dirty entry decides whether it must recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Version(pub u64);

impl Version {
    /// The version of an entry that has never been evaluated.
    pub const ZERO: Version = Version(0);
}

/// Monotonic source of [`Version`]s, owned by one graph.
#[derive(Debug, Default)]
pub struct VersionClock {
    current: AtomicU64,
}

impl VersionClock {
    /// Create a clock at [`Version::ZERO`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest version handed out.
    pub fn current(&self) -> Version {
        Version(self.current.load(Ordering::Acquire))
    }

    /// Advance the clock and return the new version.
    pub fn advance(&self) -> Version {
        Version(self.current.fetch_add(1, Ordering::AcqRel) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_monotonic() {
        let clock = VersionClock::new();
        assert_eq!(clock.current(), Version::ZERO);
        let v1 = clock.advance();
        let v2 = clock.advance();
        assert!(v1 < v2);
        assert_eq!(clock.current(), v2);
    }
}
