//! Per-root outcome of an evaluation.

use crate::diagnostic::Diagnostic;
use crate::error::NodeError;
use crate::key::NodeKey;
use crate::value::NodeValue;

/// What an evaluation produced for each requested root.
///
/// Every root ends up in exactly one of three places: it has a value, it has
/// an error, or it is unfinished. Roots are unfinished only when a run without
/// `keep_going` stopped before reaching them and no failed key was found
/// below them.
#[derive(Debug, Clone, Default)]
pub struct EvaluationResult {
    roots: Vec<NodeKey>,
    values: ahash::HashMap<NodeKey, NodeValue>,
    errors: ahash::HashMap<NodeKey, NodeError>,
    diagnostics: ahash::HashMap<NodeKey, Vec<Diagnostic>>,
    unfinished: Vec<NodeKey>,
}

impl EvaluationResult {
    pub(crate) fn new(roots: Vec<NodeKey>) -> Self {
        Self {
            roots,
            ..Default::default()
        }
    }

    pub(crate) fn insert_value(&mut self, root: NodeKey, value: NodeValue) {
        self.values.insert(root, value);
    }

    pub(crate) fn insert_error(&mut self, root: NodeKey, error: NodeError) {
        self.errors.insert(root, error);
    }

    pub(crate) fn insert_unfinished(&mut self, root: NodeKey) {
        if !self.unfinished.contains(&root) {
            self.unfinished.push(root);
        }
    }

    pub(crate) fn insert_diagnostics(&mut self, root: NodeKey, diagnostics: Vec<Diagnostic>) {
        self.diagnostics.insert(root, diagnostics);
    }

    /// The requested roots, in request order.
    pub fn roots(&self) -> &[NodeKey] {
        &self.roots
    }

    /// The value of `root`.
    pub fn get(&self, root: &NodeKey) -> Option<&NodeValue> {
        self.values.get(root)
    }

    /// The value of `root` downcast to `T`.
    pub fn get_as<T: 'static>(&self, root: &NodeKey) -> Option<&T> {
        self.get(root)?.downcast_ref()
    }

    /// The error of `root`.
    pub fn error(&self, root: &NodeKey) -> Option<&NodeError> {
        self.errors.get(root)
    }

    /// All roots with a value.
    pub fn values(&self) -> impl Iterator<Item = (&NodeKey, &NodeValue)> {
        self.values.iter()
    }

    /// All roots with an error.
    pub fn errors(&self) -> impl Iterator<Item = (&NodeKey, &NodeError)> {
        self.errors.iter()
    }

    /// Returns true if any root failed.
    pub fn has_error(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Returns true if every root has a value.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.unfinished.is_empty()
    }

    /// Roots that were neither computed nor attributed an error.
    pub fn unfinished(&self) -> &[NodeKey] {
        &self.unfinished
    }

    /// Diagnostics of `root` and of the dependencies whose diagnostics the
    /// event filter propagates to it. Empty when diagnostics are not stored.
    pub fn diagnostics(&self, root: &NodeKey) -> &[Diagnostic] {
        self.diagnostics.get(root).map_or(&[], Vec::as_slice)
    }
}
