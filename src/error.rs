//! Error types for node computation and evaluation runs.

use std::fmt;
use std::sync::Arc;

use crate::key::NodeKey;

/// Error returned by a [`NodeFunction`](crate::NodeFunction).
///
/// Failures can be propagated using the `?` operator, which automatically
/// converts any `Into<anyhow::Error>` type into `ComputeError::Failed`.
#[derive(Debug, Clone)]
pub enum ComputeError {
    /// The computation failed. Recorded on the node and cached until one of
    /// its inputs changes.
    Failed(Arc<anyhow::Error>),

    /// The computation observed cancellation and gave up. Nothing is recorded;
    /// the node will be computed again by the next evaluation.
    Interrupted,
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeError::Failed(e) => write!(f, "computation failed: {}", e),
            ComputeError::Interrupted => write!(f, "computation interrupted"),
        }
    }
}

impl<T: Into<anyhow::Error>> From<T> for ComputeError {
    fn from(err: T) -> Self {
        ComputeError::Failed(Arc::new(err.into()))
    }
}

impl ComputeError {
    /// Returns a reference to the inner error if this is a `Failed` variant.
    pub fn failure(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            ComputeError::Failed(e) => Some(e),
            ComputeError::Interrupted => None,
        }
    }
}

/// Failure recorded for a key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeError {
    /// The function of `key` reported a failure.
    #[error("computing {key:?} failed: {error}")]
    Computation {
        /// The key whose function failed.
        key: NodeKey,
        /// What the function reported.
        error: Arc<anyhow::Error>,
    },

    /// A dependency failed and the dependent did not recover.
    ///
    /// `chain` starts with the key this error is recorded on and ends with the
    /// key that failed first; `cause` is that key's own error.
    #[error("{} depends on a failed key: {cause}", format_chain(.chain))]
    Dependency {
        /// Keys from the reporting key down to the failed one.
        chain: Vec<NodeKey>,
        /// The originating failure. Never itself a `Dependency` error.
        cause: Arc<NodeError>,
    },

    /// The key is part of a dependency cycle.
    #[error("dependency cycle detected: {}", format_chain(.cycle))]
    Cycle {
        /// The keys on the cycle, in request order, starting and ending with
        /// the same key.
        cycle: Vec<NodeKey>,
    },
}

fn format_chain(keys: &[NodeKey]) -> String {
    keys.iter()
        .map(|k| k.debug_repr())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl NodeError {
    /// Build the error recorded on `key` when its dependency `dep` failed with
    /// `dep_error`.
    pub fn dependency(key: NodeKey, dep: NodeKey, dep_error: &NodeError) -> Self {
        match dep_error {
            NodeError::Dependency { chain, cause } => {
                let mut extended = Vec::with_capacity(chain.len() + 1);
                extended.push(key);
                extended.extend(chain.iter().cloned());
                NodeError::Dependency {
                    chain: extended,
                    cause: cause.clone(),
                }
            }
            other => NodeError::Dependency {
                chain: vec![key, dep],
                cause: Arc::new(other.clone()),
            },
        }
    }

    /// The key this error is recorded on.
    pub fn key(&self) -> Option<&NodeKey> {
        match self {
            NodeError::Computation { key, .. } => Some(key),
            NodeError::Dependency { chain, .. } => chain.first(),
            NodeError::Cycle { cycle } => cycle.first(),
        }
    }

    /// The error that started it all: `self` unless this is a `Dependency` error.
    pub fn root_cause(&self) -> &NodeError {
        match self {
            NodeError::Dependency { cause, .. } => cause,
            other => other,
        }
    }

    /// The key chain of a `Dependency` error, empty otherwise.
    pub fn chain(&self) -> &[NodeKey] {
        match self {
            NodeError::Dependency { chain, .. } => chain,
            _ => &[],
        }
    }

    /// Returns `true` for cycle errors, including propagated ones.
    pub fn is_cycle(&self) -> bool {
        matches!(self.root_cause(), NodeError::Cycle { .. })
    }

    /// Attempts to downcast the root computation failure to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        match self.root_cause() {
            NodeError::Computation { error, .. } => error.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// Outcome of a run that was aborted as a whole.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvaluationError {
    /// Cancellation was observed. Every unfinished node was rolled back.
    #[error("evaluation interrupted")]
    Interrupted,

    /// A computation function broke the engine's contract. This is a bug in
    /// the function and is never retried.
    #[error("contract violation while computing {key:?}: {message}")]
    ContractViolation {
        /// The key being computed.
        key: NodeKey,
        /// What went wrong.
        message: String,
    },

    /// A computation function panicked.
    #[error("computing {key:?} panicked: {message}")]
    Panicked {
        /// The key being computed.
        key: NodeKey,
        /// The panic payload, if it was a string.
        message: String,
    },
}

/// Error building an [`Evaluator`](crate::Evaluator).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
