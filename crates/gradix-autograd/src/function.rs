//! Function - Backward Graph Node Contract
//!
//! A `Function` is one node of the backward graph: it consumes the gradient
//! tensors flowing into it (one per forward output it produced) and emits
//! gradients for its `next_functions` edges, which point toward the leaves.
//! Concrete nodes are supplied by the operator library; the engine only sees
//! this contract plus the shared `FunctionMeta` record every node carries.
//!
//! `FnHandle` wraps nodes in an `Arc` so the graph can share them, and
//! derives a stable identity from the allocation address — the key the
//! engine uses for its dependency and ready-buffer maps.
//!
//! @version 0.1.0
//! @author `Gradix` Development Team

use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::error::Result;
use crate::variable::Variable;

/// A gradient list: one optional `Variable` per slot.
///
/// `None` marks a slot no gradient flows through (an absent edge, or a
/// propagation suppressed by a callback).
pub type VarList = Vec<Option<Variable>>;

// =============================================================================
// Hooks
// =============================================================================

/// Transformer over a gradient list, run before a function evaluates.
///
/// Also used for leaf accumulation hooks, where the list has one entry.
pub trait FunctionPreHook: Send + Sync {
    /// Maps the incoming gradient list to the one the function will see.
    fn call(&self, inputs: VarList) -> Result<VarList>;
}

/// Transformer over a function's output gradients, given its inputs.
pub trait FunctionPostHook: Send + Sync {
    /// Maps the produced gradient list to the one that will propagate.
    fn call(&self, outputs: VarList, inputs: &[Option<Variable>]) -> Result<VarList>;
}

// =============================================================================
// Edges
// =============================================================================

/// One backward edge: the consumer function and the input slot the gradient
/// lands in. An absent function means no gradient is needed along this edge.
#[derive(Clone)]
pub struct Edge {
    /// The function the gradient flows to, if any.
    pub function: Option<FnHandle>,
    /// Which input slot of that function receives the gradient.
    pub input_nr: usize,
}

impl Edge {
    /// Creates an edge.
    #[must_use]
    pub fn new(function: Option<FnHandle>, input_nr: usize) -> Self {
        Self { function, input_nr }
    }
}

impl Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.function {
            Some(func) => write!(f, "Edge({} @ {})", func.name(), self.input_nr),
            None => write!(f, "Edge(-)"),
        }
    }
}

// =============================================================================
// Function Metadata
// =============================================================================

/// State shared by every backward-graph node.
///
/// `num_inputs` counts the forward outputs the node produced (and therefore
/// the gradients it expects); it is bumped as output variables are created.
/// `next_functions` is wired by the operator library once the node's inputs
/// are known.
pub struct FunctionMeta {
    num_inputs: AtomicUsize,
    next_functions: RwLock<Vec<Edge>>,
    is_executable: bool,
    is_stochastic: bool,
    pre_hooks: RwLock<Vec<Arc<dyn FunctionPreHook>>>,
    post_hooks: RwLock<Vec<Arc<dyn FunctionPostHook>>>,
}

impl FunctionMeta {
    /// Creates metadata with the given policy flags and no edges.
    #[must_use]
    pub fn new(is_executable: bool, is_stochastic: bool) -> Self {
        Self {
            num_inputs: AtomicUsize::new(0),
            next_functions: RwLock::new(Vec::new()),
            is_executable,
            is_stochastic,
            pre_hooks: RwLock::new(Vec::new()),
            post_hooks: RwLock::new(Vec::new()),
        }
    }

    /// Creates metadata from flags computed over a node's forward inputs.
    #[must_use]
    pub fn from_flags(flags: FunctionFlags) -> Self {
        let meta = Self::new(flags.is_executable, false);
        *meta.next_functions.write() = flags.next_functions;
        meta
    }

    /// Returns how many gradient inputs this node expects.
    #[must_use]
    pub fn num_inputs(&self) -> usize {
        self.num_inputs.load(Ordering::Acquire)
    }

    /// Sets the expected gradient input count.
    pub fn set_num_inputs(&self, n: usize) {
        self.num_inputs.store(n, Ordering::Release);
    }

    /// Post-increments the input count, returning the previous value.
    ///
    /// Called once per output variable the node produces; the returned value
    /// becomes that variable's `output_nr`.
    pub fn bump_num_inputs(&self) -> usize {
        self.num_inputs.fetch_add(1, Ordering::AcqRel)
    }

    /// Returns a snapshot of the backward edges.
    #[must_use]
    pub fn next_functions(&self) -> Vec<Edge> {
        self.next_functions.read().clone()
    }

    /// Returns the number of backward edges.
    #[must_use]
    pub fn num_next_functions(&self) -> usize {
        self.next_functions.read().len()
    }

    /// Replaces the backward edges.
    pub fn set_next_functions(&self, edges: Vec<Edge>) {
        *self.next_functions.write() = edges;
    }

    /// Returns true if some path from this node reaches a leaf requiring grad.
    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.is_executable
    }

    /// Returns true if this node must run every backward pass.
    #[must_use]
    pub fn is_stochastic(&self) -> bool {
        self.is_stochastic
    }

    /// Appends a pre-hook.
    pub fn add_pre_hook(&self, hook: Arc<dyn FunctionPreHook>) {
        self.pre_hooks.write().push(hook);
    }

    /// Appends a post-hook.
    pub fn add_post_hook(&self, hook: Arc<dyn FunctionPostHook>) {
        self.post_hooks.write().push(hook);
    }

    /// Returns the registered pre-hooks.
    #[must_use]
    pub fn pre_hooks(&self) -> Vec<Arc<dyn FunctionPreHook>> {
        self.pre_hooks.read().clone()
    }

    /// Returns the registered post-hooks.
    #[must_use]
    pub fn post_hooks(&self) -> Vec<Arc<dyn FunctionPostHook>> {
        self.post_hooks.read().clone()
    }
}

// =============================================================================
// Function Trait
// =============================================================================

/// A node of the backward graph.
pub trait Function: Send + Sync {
    /// Returns the node's shared metadata.
    fn meta(&self) -> &FunctionMeta;

    /// Consumes the gradients at this node's inputs and produces one gradient
    /// per `next_functions` edge.
    fn apply(&self, inputs: VarList) -> Result<VarList>;

    /// Drops saved forward state once the node will not be evaluated again.
    fn release_variables(&self) {}

    /// Returns the node's name for diagnostics.
    fn name(&self) -> String;
}

// =============================================================================
// FnHandle - Shared Node Handle
// =============================================================================

/// Stable identity of a function node, derived from its allocation address.
pub type FnId = usize;

/// Reference-counted handle to a backward-graph node.
#[derive(Clone)]
pub struct FnHandle {
    inner: Arc<dyn Function>,
}

impl FnHandle {
    /// Wraps a concrete node.
    pub fn new<F: Function + 'static>(func: F) -> Self {
        Self {
            inner: Arc::new(func),
        }
    }

    /// Wraps an already-shared node.
    #[must_use]
    pub fn from_arc(inner: Arc<dyn Function>) -> Self {
        Self { inner }
    }

    /// Returns a stable ID that survives cloning.
    ///
    /// Uses the Arc's data pointer, which is shared by all clones of this
    /// handle and never reused while any of them is alive.
    #[must_use]
    pub fn id(&self) -> FnId {
        Arc::as_ptr(&self.inner).cast::<()>() as FnId
    }

    /// Downgrades to a weak handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakFnHandle {
        WeakFnHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Evaluates the node.
    pub fn apply(&self, inputs: VarList) -> Result<VarList> {
        self.inner.apply(inputs)
    }

    /// Releases the node's saved forward state.
    pub fn release_variables(&self) {
        self.inner.release_variables();
    }

    /// Returns the node's name.
    #[must_use]
    pub fn name(&self) -> String {
        self.inner.name()
    }

    /// Returns the node's shared metadata.
    #[must_use]
    pub fn meta(&self) -> &FunctionMeta {
        self.inner.meta()
    }

    /// Returns how many gradient inputs the node expects.
    #[must_use]
    pub fn num_inputs(&self) -> usize {
        self.meta().num_inputs()
    }

    /// Returns a snapshot of the node's backward edges.
    #[must_use]
    pub fn next_functions(&self) -> Vec<Edge> {
        self.meta().next_functions()
    }

    /// Returns the number of backward edges.
    #[must_use]
    pub fn num_next_functions(&self) -> usize {
        self.meta().num_next_functions()
    }

    /// Returns true if the node lies on a path to a leaf requiring grad.
    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.meta().is_executable()
    }

    /// Returns true if the node must run every backward pass.
    #[must_use]
    pub fn is_stochastic(&self) -> bool {
        self.meta().is_stochastic()
    }
}

impl Debug for FnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FnHandle({})", self.name())
    }
}

/// Weak counterpart of [`FnHandle`], used to break reference cycles.
#[derive(Clone)]
pub struct WeakFnHandle {
    inner: Weak<dyn Function>,
}

impl WeakFnHandle {
    /// Attempts to upgrade to a strong handle.
    #[must_use]
    pub fn upgrade(&self) -> Option<FnHandle> {
        self.inner.upgrade().map(|inner| FnHandle { inner })
    }

    /// Returns true if the node has been dropped.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

// =============================================================================
// Function Flags
// =============================================================================

/// Policy computed over a node's forward inputs: whether the node is
/// executable, whether its outputs are volatile, and the backward edge list.
#[derive(Default)]
pub struct FunctionFlags {
    /// True if any input requires grad and none is volatile.
    pub is_executable: bool,
    /// True if any input is volatile.
    pub is_volatile: bool,
    /// One edge per input: its `grad_fn`, or its leaf accumulator.
    pub next_functions: Vec<Edge>,
}

impl FunctionFlags {
    /// Computes flags and edges for a node consuming `inputs`.
    ///
    /// A non-leaf input contributes an edge to its producer at the producing
    /// output slot; a leaf input requiring grad contributes an edge to its
    /// gradient accumulator at slot 0; anything else contributes a null edge.
    #[must_use]
    pub fn of(inputs: &[Variable]) -> Self {
        let mut flags = Self::default();
        let mut any_requires = false;
        for var in inputs {
            any_requires |= var.requires_grad();
            flags.is_volatile |= var.is_volatile();
            let edge = match var.grad_fn() {
                Some(grad_fn) => Edge::new(Some(grad_fn), var.output_nr()),
                None => Edge::new(var.get_grad_accumulator(), 0),
            };
            flags.next_functions.push(edge);
        }
        flags.is_executable = !flags.is_volatile && any_requires;
        flags
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use gradix_tensor::Tensor;

    struct NoopFn {
        meta: FunctionMeta,
    }

    impl NoopFn {
        fn new() -> Self {
            Self {
                meta: FunctionMeta::new(true, false),
            }
        }
    }

    impl Function for NoopFn {
        fn meta(&self) -> &FunctionMeta {
            &self.meta
        }

        fn apply(&self, inputs: VarList) -> Result<VarList> {
            Ok(inputs)
        }

        fn name(&self) -> String {
            "NoopFn".into()
        }
    }

    #[test]
    fn test_handle_id_survives_cloning() {
        let f = FnHandle::new(NoopFn::new());
        let g = f.clone();
        assert_eq!(f.id(), g.id());

        let other = FnHandle::new(NoopFn::new());
        assert_ne!(f.id(), other.id());
    }

    #[test]
    fn test_bump_num_inputs() {
        let f = FnHandle::new(NoopFn::new());
        assert_eq!(f.meta().bump_num_inputs(), 0);
        assert_eq!(f.meta().bump_num_inputs(), 1);
        assert_eq!(f.num_inputs(), 2);
    }

    #[test]
    fn test_weak_handle_expires() {
        let f = FnHandle::new(NoopFn::new());
        let weak = f.downgrade();
        assert!(weak.upgrade().is_some());
        drop(f);
        assert!(weak.expired());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_flags_of_leaf_inputs() {
        let leaf = Variable::new(Tensor::scalar(1.0), true, false);
        let plain = Variable::new(Tensor::scalar(2.0), false, false);
        let flags = FunctionFlags::of(&[leaf.clone(), plain]);

        assert!(flags.is_executable);
        assert!(!flags.is_volatile);
        assert_eq!(flags.next_functions.len(), 2);
        // The leaf contributes its accumulator, the plain input a null edge.
        assert!(flags.next_functions[0].function.is_some());
        assert!(flags.next_functions[1].function.is_none());

        let acc = leaf.get_grad_accumulator().unwrap();
        assert_eq!(flags.next_functions[0].function.as_ref().unwrap().id(), acc.id());
    }

    #[test]
    fn test_flags_volatile_wins() {
        let leaf = Variable::new(Tensor::scalar(1.0), true, false);
        let volatile = Variable::new(Tensor::scalar(2.0), false, true);
        let flags = FunctionFlags::of(&[leaf, volatile]);
        assert!(flags.is_volatile);
        assert!(!flags.is_executable);
    }
}
