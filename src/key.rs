//! Key types identifying nodes in the evaluation graph.

use std::any::Any;
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dyn_hash::DynHash;

/// Object-safe equality comparison.
///
/// This trait enables comparing two trait objects for equality
/// by downcasting and comparing the concrete types.
pub trait DynEq: Any {
    /// Compare self with another value for equality.
    ///
    /// Returns `true` if `other` is the same concrete type and equal to `self`.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Eq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// Trait for the kind-specific argument carried by a [`NodeKey`].
///
/// It is automatically implemented for all types that implement
/// `Hash + Eq + Debug + Send + Sync + 'static`, so plain structs, tuples,
/// strings and integers can all serve as arguments.
pub trait KeyArgument: DynHash + DynEq + Debug + Send + Sync {
    /// Get the argument as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Get the type name of the argument.
    fn type_name(&self) -> &'static str;
}

impl<T: Hash + Eq + Debug + Send + Sync + 'static> KeyArgument for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

dyn_hash::hash_trait_object!(KeyArgument);

/// Discriminant selecting the function that computes a key.
///
/// Kinds are compared by name, so two kinds created from the same string are
/// the same kind.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKind(&'static str);

impl NodeKind {
    /// Create a kind from its name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The name of this kind.
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

struct KeyData {
    kind: NodeKind,
    argument: Box<dyn KeyArgument>,
}

/// Immutable identifier of a computation: a [`NodeKind`] plus an argument.
///
/// Equality and hashing are structural over both parts. Cloning is cheap as
/// the data is behind an `Arc`.
///
/// # Example
///
/// ```
/// # use nodeflow::{NodeKey, NodeKind};
/// const FILE: NodeKind = NodeKind::new("FILE");
///
/// let a = NodeKey::new(FILE, "src/main.rs".to_string());
/// let b = NodeKey::new(FILE, "src/main.rs".to_string());
/// assert_eq!(a, b);
/// assert_eq!(a.argument::<String>().map(String::as_str), Some("src/main.rs"));
/// ```
#[derive(Clone)]
pub struct NodeKey(Arc<KeyData>);

impl NodeKey {
    /// Create a new key of `kind` with the given argument.
    pub fn new<A: KeyArgument + 'static>(kind: NodeKind, argument: A) -> Self {
        Self(Arc::new(KeyData {
            kind,
            argument: Box::new(argument),
        }))
    }

    /// The kind of this key.
    pub fn kind(&self) -> NodeKind {
        self.0.kind
    }

    /// Downcast the argument to its original type.
    pub fn argument<A: 'static>(&self) -> Option<&A> {
        self.argument_dyn().as_any().downcast_ref()
    }

    /// Get a reference to the type-erased argument.
    pub fn argument_dyn(&self) -> &dyn KeyArgument {
        self.0.argument.as_ref()
    }

    /// Get the debug representation of this key.
    pub fn debug_repr(&self) -> String {
        format!("{:?}", self)
    }
}

impl Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.0.kind, self.argument_dyn())
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

impl Hash for NodeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.kind.hash(state);
        self.argument_dyn().hash(state);
    }
}

impl PartialEq for NodeKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.0.kind == other.0.kind
                && self.argument_dyn().dyn_eq(other.argument_dyn().as_any()))
    }
}

impl Eq for NodeKey {}
