//! Tracer trait for observing evaluation.
//!
//! This module defines the [`Tracer`] trait and related types for observing
//! node execution. The default [`NoopTracer`] provides zero-cost when tracing
//! is not needed.
//!
//! # Example
//!
//! ```
//! use nodeflow::{ExecutionResult, NodeKey, SpanId, Tracer};
//!
//! struct PrintTracer;
//!
//! impl Tracer for PrintTracer {
//!     fn new_span_id(&self) -> SpanId {
//!         SpanId(1)
//!     }
//!
//!     fn on_node_end(&self, _span_id: SpanId, key: &NodeKey, result: &ExecutionResult) {
//!         println!("{key:?}: {result:?}");
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crate::key::NodeKey;

/// Unique identifier for one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(pub u64);

/// Classification of a finished task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The function produced a value different from the previous one.
    Changed,
    /// The function produced a value equal to the previous one (early cutoff).
    Unchanged,
    /// A dirty node re-verified its dependencies and found nothing changed.
    /// The function was not invoked.
    Verified,
    /// A dirty node found a changed dependency and is recomputed next.
    DependencyChanged,
    /// The task is waiting for missing dependencies.
    Parked,
    /// The node was found on a dependency cycle.
    CycleDetected,
    /// The node completed with an error.
    Failed {
        /// Display of the recorded error.
        message: String,
    },
}

/// Why a node was marked dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationReason {
    /// The node was named as changed.
    Changed,
    /// A value was injected for the node.
    Injected,
    /// A transitive dependency was invalidated.
    DependencyDirtied,
}

/// Tracer trait for observing evaluation.
///
/// All methods but [`new_span_id`](Self::new_span_id) have default empty
/// implementations, so only the events of interest need overriding.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` as the tracer is called from every
/// worker thread concurrently.
pub trait Tracer: Send + Sync + 'static {
    /// Generate a new unique span ID.
    ///
    /// Called once per task: a computation attempt or a dependency check.
    fn new_span_id(&self) -> SpanId;

    /// Called when a task for `key` starts.
    #[inline]
    fn on_node_start(&self, _span_id: SpanId, _key: &NodeKey) {}

    /// Called when a task for `key` ends.
    #[inline]
    fn on_node_end(&self, _span_id: SpanId, _key: &NodeKey, _result: &ExecutionResult) {}

    /// Called the first time a computation requests `dependency` in a run.
    #[inline]
    fn on_dependency_registered(&self, _span_id: SpanId, _parent: &NodeKey, _dependency: &NodeKey) {}

    /// Called when a recomputed value is compared against the previous one.
    #[inline]
    fn on_early_cutoff_check(&self, _span_id: SpanId, _key: &NodeKey, _output_changed: bool) {}

    /// Called when a node is marked dirty.
    #[inline]
    fn on_node_invalidated(&self, _key: &NodeKey, _reason: InvalidationReason) {}

    /// Called with the path of each detected cycle, first key repeated last.
    #[inline]
    fn on_cycle_detected(&self, _path: &[NodeKey]) {}
}

/// Zero-cost tracer that discards all events.
///
/// This is the default tracer for [`Evaluator`](crate::Evaluator).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

/// Global span counter for NoopTracer.
static NOOP_SPAN_COUNTER: AtomicU64 = AtomicU64::new(1);

impl Tracer for NoopTracer {
    #[inline(always)]
    fn new_span_id(&self) -> SpanId {
        SpanId(NOOP_SPAN_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}
