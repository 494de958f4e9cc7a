//! Type-erased node values.

use std::any::Any;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Object-safe view of a value stored in the graph.
///
/// Automatically implemented for every `PartialEq + Debug + Send + Sync + 'static`
/// type.
pub trait ValueData: Debug + Send + Sync {
    /// Get the value as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Compare with another value. Values of different types are never equal.
    fn dyn_eq(&self, other: &dyn Any) -> bool;

    /// Get the type name of the value.
    fn type_name(&self) -> &'static str;
}

impl<T: PartialEq + Debug + Send + Sync + 'static> ValueData for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Immutable result of a computation.
///
/// The engine treats the content as opaque except for equality, which decides
/// whether a recomputed node actually changed. When it did not, dependents
/// are not recomputed.
///
/// # Example
///
/// ```
/// # use nodeflow::NodeValue;
/// let a = NodeValue::new(42i64);
/// assert_eq!(a, NodeValue::new(42i64));
/// assert_ne!(a, NodeValue::new(42i32));
/// assert_eq!(a.downcast_ref::<i64>(), Some(&42));
/// ```
#[derive(Clone)]
pub struct NodeValue(Arc<dyn ValueData>);

impl NodeValue {
    /// Wrap a value.
    pub fn new<T: PartialEq + Debug + Send + Sync + 'static>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Downcast to the concrete type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref()
    }

    /// Returns `true` if the value holds a `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.0.as_any().is::<T>()
    }

    /// Get the type name of the wrapped value.
    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }
}

impl Debug for NodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

impl PartialEq for NodeValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.dyn_eq(other.0.as_any())
    }
}
