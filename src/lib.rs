//! Nodeflow: a parallel, incremental evaluation engine for dependency graphs
//! discovered at runtime.
//!
//! Values are identified by a [`NodeKey`] and computed by the [`NodeFunction`]
//! registered for the key's [`NodeKind`]. A function asks for the values it
//! depends on through its [`Environment`]; dependencies are therefore only
//! known once the function runs. Results are cached in an [`InMemoryGraph`],
//! and after [`Evaluator::invalidate`] only the nodes whose inputs actually
//! changed are computed again.
//!
//! # Key Features
//!
//! - **Dynamic dependencies**: a function returns `Ok(None)` while dependencies
//!   are missing and is invoked again once they are available
//! - **Parallel**: independent nodes run concurrently on a rayon pool, and
//!   each node is computed at most once per evaluation
//! - **Early cutoff**: a recomputed value equal to the previous one does not
//!   rebuild its dependents
//! - **Partial failure**: with `keep_going` a failure only affects the nodes
//!   that depend on it, and dependents may recover
//! - **Cycle detection**: nodes waiting on each other fail with
//!   [`NodeError::Cycle`] instead of deadlocking
//! - **Diagnostics**: warnings and errors reported by functions are stored per
//!   node and collected per root, subject to an [`EventFilter`]
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicI64, Ordering};
//! use std::sync::Arc;
//! use nodeflow::{ComputeResult, Environment, Evaluator, NodeKey, NodeKind, NodeValue};
//!
//! const INPUT: NodeKind = NodeKind::new("INPUT");
//! const DOUBLE: NodeKind = NodeKind::new("DOUBLE");
//!
//! let input = Arc::new(AtomicI64::new(1));
//! let source = input.clone();
//! let evaluator = Evaluator::builder()
//!     .function(INPUT, move |_key: &NodeKey, _env: &mut Environment<'_>| -> ComputeResult {
//!         Ok(Some(NodeValue::new(source.load(Ordering::SeqCst))))
//!     })
//!     .function(DOUBLE, |_key: &NodeKey, env: &mut Environment<'_>| -> ComputeResult {
//!         let Some(value) = env.get_value(&NodeKey::new(INPUT, ())) else {
//!             return Ok(None);
//!         };
//!         let n = value.downcast_ref::<i64>().copied().unwrap_or_default();
//!         Ok(Some(NodeValue::new(n * 2)))
//!     })
//!     .build()
//!     .unwrap();
//!
//! let root = NodeKey::new(DOUBLE, ());
//! let result = evaluator.evaluate(&[root.clone()], false).unwrap();
//! assert_eq!(result.get_as::<i64>(&root), Some(&2));
//!
//! input.store(5, Ordering::SeqCst);
//! evaluator.invalidate([NodeKey::new(INPUT, ())]);
//! let result = evaluator.evaluate(&[root.clone()], false).unwrap();
//! assert_eq!(result.get_as::<i64>(&root), Some(&10));
//! ```
//!
//! # Observing evaluation
//!
//! Operational logs go through the `tracing` crate. Structured per-node events
//! are delivered to a [`Tracer`], see the [`tracer`] module.
#![warn(missing_docs)]

mod cancel;
mod cycle;
mod diagnostic;
mod entry;
mod error;
mod evaluator;
mod function;
mod graph;
mod invalidation;
mod key;
mod result;
pub mod tracer;
mod value;
mod version;

pub use cancel::CancellationToken;
pub use diagnostic::{Diagnostic, DiagnosticKind, EventFilter, KindFilter, NoStorage, StoreAll};
pub use entry::{DirtyState, GroupedDeps, NodeEntry, NodeState};
pub use error::{BuildError, ComputeError, EvaluationError, NodeError};
pub use evaluator::{Evaluator, EvaluatorBuilder};
pub use function::{ComputeResult, Environment, FunctionRegistry, NodeFunction};
pub use graph::InMemoryGraph;
pub use invalidation::InvalidationReport;
pub use key::{DynEq, KeyArgument, NodeKey, NodeKind};
pub use result::EvaluationResult;
pub use tracer::{ExecutionResult, InvalidationReason, NoopTracer, SpanId, Tracer};
pub use value::{NodeValue, ValueData};
pub use version::{Version, VersionClock};
