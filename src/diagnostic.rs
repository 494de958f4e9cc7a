//! Diagnostics emitted by computations and the filter deciding which are kept.
//!
//! Computations report [`Diagnostic`]s through
//! [`Environment::report`](crate::Environment::report). Whether they are
//! stored on the node, and whether a dependency's diagnostics show up in the
//! transcript of the root that requested it, is decided by the evaluator's
//! [`EventFilter`].

use std::fmt;

use crate::key::NodeKey;

/// Severity or category of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    /// A failure reported by a computation.
    Error,
    /// Something suspicious that did not stop the computation.
    Warning,
    /// Informational output.
    Info,
    /// Progress notification.
    Progress,
}

/// A message emitted while computing a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// The category of the message.
    pub kind: DiagnosticKind,
    /// Human readable text.
    pub message: String,
    /// The key whose computation emitted it. Filled in by the evaluator.
    pub origin: Option<NodeKey>,
}

impl Diagnostic {
    /// Create a diagnostic of the given kind.
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            origin: None,
        }
    }

    /// Shorthand for an [`DiagnosticKind::Error`] diagnostic.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Error, message)
    }

    /// Shorthand for a [`DiagnosticKind::Warning`] diagnostic.
    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Warning, message)
    }

    /// Shorthand for an [`DiagnosticKind::Info`] diagnostic.
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Info, message)
    }

    /// Shorthand for a [`DiagnosticKind::Progress`] diagnostic.
    pub fn progress(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Progress, message)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Info => "info",
            DiagnosticKind::Progress => "progress",
        };
        match &self.origin {
            Some(origin) => write!(f, "{label} [{origin:?}]: {}", self.message),
            None => write!(f, "{label}: {}", self.message),
        }
    }
}

/// Decides which diagnostics are stored during evaluation.
///
/// The evaluator reads [`store_events_and_posts`](Self::store_events_and_posts)
/// once per run. When it is `false` no per-node diagnostic buffer is
/// allocated at all, and [`should_propagate`](Self::should_propagate) is never
/// called.
pub trait EventFilter: Send + Sync + 'static {
    /// Returns true if any diagnostics should be stored.
    fn store_events_and_posts(&self) -> bool;

    /// Returns true if this diagnostic should be stored on the emitting node.
    fn accepts(&self, diagnostic: &Diagnostic) -> bool;

    /// Whether the stored diagnostics of `dep` are carried into the transcript
    /// of `primary`, which depends on it.
    ///
    /// Only relevant if [`store_events_and_posts`](Self::store_events_and_posts)
    /// returns `true`.
    fn should_propagate(&self, _dep: &NodeKey, _primary: &NodeKey) -> bool {
        true
    }
}

/// Stores every diagnostic and propagates them along every edge.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreAll;

impl EventFilter for StoreAll {
    fn store_events_and_posts(&self) -> bool {
        true
    }

    fn accepts(&self, _diagnostic: &Diagnostic) -> bool {
        true
    }
}

/// Stores nothing.
///
/// Asking it about propagation is a bug in the caller and panics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStorage;

impl EventFilter for NoStorage {
    fn store_events_and_posts(&self) -> bool {
        false
    }

    fn accepts(&self, _diagnostic: &Diagnostic) -> bool {
        false
    }

    fn should_propagate(&self, dep: &NodeKey, primary: &NodeKey) -> bool {
        panic!(
            "NoStorage filter asked whether to propagate diagnostics from {:?} to {:?}",
            dep, primary
        )
    }
}

/// Stores only diagnostics of the listed kinds.
#[derive(Debug, Clone, Default)]
pub struct KindFilter {
    kinds: Vec<DiagnosticKind>,
}

impl KindFilter {
    /// Keep diagnostics whose kind is in `kinds`.
    pub fn new(kinds: impl IntoIterator<Item = DiagnosticKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
        }
    }

    /// Keep errors and warnings only.
    pub fn errors_and_warnings() -> Self {
        Self::new([DiagnosticKind::Error, DiagnosticKind::Warning])
    }
}

impl EventFilter for KindFilter {
    fn store_events_and_posts(&self) -> bool {
        !self.kinds.is_empty()
    }

    fn accepts(&self, diagnostic: &Diagnostic) -> bool {
        self.kinds.contains(&diagnostic.kind)
    }
}
