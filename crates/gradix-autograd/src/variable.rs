//! Variable - Gradient-Bearing Tensor Wrapper
//!
//! A `Variable` couples a tensor with its autograd state: the `Function`
//! that produced it (absent for leaves), the accumulated gradient (leaves
//! only), a shared version counter that detects in-place mutation of saved
//! inputs, and a lazily created gradient accumulator.
//!
//! `SavedVariable` is the snapshot a `Function` captures during forward so
//! its backward can replay the input later; unpacking validates that nobody
//! mutated the tensor in between.
//!
//! @version 0.1.0
//! @author `Gradix` Development Team

use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use gradix_tensor::Tensor;

use crate::accumulate_grad::AccumulateGrad;
use crate::error::{AutogradError, Result};
use crate::function::{FnHandle, FunctionPreHook, WeakFnHandle};

// =============================================================================
// Version Counter
// =============================================================================

/// Shared monotone counter bumped on every in-place mutation of a tensor.
///
/// A variable and all snapshots saved from it observe one counter cell, so a
/// mutation after saving is detectable at unpack time. `join_with` redirects
/// this counter to another's cell, merging their histories.
pub struct VersionCounter {
    block: RwLock<Arc<AtomicU32>>,
}

impl VersionCounter {
    /// Creates a counter at version zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            block: RwLock::new(Arc::new(AtomicU32::new(0))),
        }
    }

    pub(crate) fn from_block(block: Arc<AtomicU32>) -> Self {
        Self {
            block: RwLock::new(block),
        }
    }

    /// Records one in-place mutation.
    pub fn bump(&self) {
        self.block.read().fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the current version.
    #[must_use]
    pub fn current(&self) -> u32 {
        self.block.read().load(Ordering::SeqCst)
    }

    /// Redirects this counter to share `other`'s cell.
    pub fn join_with(&self, other: &VersionCounter) {
        *self.block.write() = other.snapshot();
    }

    pub(crate) fn snapshot(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.block.read())
    }
}

impl Default for VersionCounter {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Variable
// =============================================================================

struct VariableImpl {
    data: RwLock<Tensor>,
    grad_fn: Option<FnHandle>,
    grad: RwLock<Option<Variable>>,
    version_counter: VersionCounter,
    requires_grad: bool,
    is_volatile: bool,
    output_nr: usize,
    grad_accumulator: Mutex<Weak<AccumulateGrad>>,
    hooks: RwLock<Vec<Arc<dyn FunctionPreHook>>>,
}

/// A tensor with autograd state. Cloning shares the state.
#[derive(Clone)]
pub struct Variable {
    inner: Arc<VariableImpl>,
}

impl Variable {
    /// Creates a leaf variable.
    ///
    /// A volatile variable disables grad tracking through every operation
    /// that consumes it; `requires_grad` and `is_volatile` together make a
    /// variable that can never be executable.
    #[must_use]
    pub fn new(data: Tensor, requires_grad: bool, is_volatile: bool) -> Self {
        Self {
            inner: Arc::new(VariableImpl {
                data: RwLock::new(data),
                grad_fn: None,
                grad: RwLock::new(None),
                version_counter: VersionCounter::new(),
                requires_grad,
                is_volatile,
                output_nr: 0,
                grad_accumulator: Mutex::new(Weak::new()),
                hooks: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Creates an interior variable produced by `grad_fn`.
    ///
    /// The variable requires grad iff the producer is executable, and claims
    /// the producer's next output slot.
    #[must_use]
    pub fn from_grad_fn(data: Tensor, grad_fn: FnHandle) -> Self {
        let requires_grad = grad_fn.is_executable();
        let output_nr = grad_fn.meta().bump_num_inputs();
        Self {
            inner: Arc::new(VariableImpl {
                data: RwLock::new(data),
                grad_fn: Some(grad_fn),
                grad: RwLock::new(None),
                version_counter: VersionCounter::new(),
                requires_grad,
                is_volatile: false,
                output_nr,
                grad_accumulator: Mutex::new(Weak::new()),
                hooks: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Rebuilds a variable from a saved snapshot. Internal to `unpack`.
    fn unpacked(
        data: Tensor,
        grad_fn: Option<FnHandle>,
        requires_grad: bool,
        is_volatile: bool,
        output_nr: usize,
        version_block: Arc<AtomicU32>,
        grad_accumulator: Weak<AccumulateGrad>,
    ) -> Self {
        Self {
            inner: Arc::new(VariableImpl {
                data: RwLock::new(data),
                grad_fn,
                grad: RwLock::new(None),
                version_counter: VersionCounter::from_block(version_block),
                requires_grad,
                is_volatile,
                output_nr,
                grad_accumulator: Mutex::new(grad_accumulator),
                hooks: RwLock::new(Vec::new()),
            }),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Returns a shallow handle to the tensor.
    #[must_use]
    pub fn data(&self) -> Tensor {
        self.inner.data.read().clone_shallow()
    }

    /// Replaces the tensor (used when accumulation promotes sparse to dense).
    pub fn set_data(&self, data: Tensor) {
        *self.inner.data.write() = data;
    }

    /// Returns the accumulated gradient, if any.
    #[must_use]
    pub fn grad(&self) -> Option<Variable> {
        self.inner.grad.read().clone()
    }

    /// Stores the accumulated gradient.
    pub fn set_grad(&self, grad: Variable) {
        *self.inner.grad.write() = Some(grad);
    }

    /// Returns the producing function, if this is not a leaf.
    #[must_use]
    pub fn grad_fn(&self) -> Option<FnHandle> {
        self.inner.grad_fn.clone()
    }

    /// Returns true if this variable has no producing function.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.inner.grad_fn.is_none()
    }

    /// Returns whether gradients are requested for this variable.
    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.inner.requires_grad
    }

    /// Returns whether grad tracking is disabled through this variable.
    #[must_use]
    pub fn is_volatile(&self) -> bool {
        self.inner.is_volatile
    }

    /// Returns which output slot of `grad_fn` produced this variable.
    #[must_use]
    pub fn output_nr(&self) -> usize {
        self.inner.output_nr
    }

    /// Returns true if the two handles refer to the same variable.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // =========================================================================
    // Versioning
    // =========================================================================

    /// Returns the variable's version counter.
    #[must_use]
    pub fn version_counter(&self) -> &VersionCounter {
        &self.inner.version_counter
    }

    /// Returns the current in-place mutation count.
    #[must_use]
    pub fn current_version(&self) -> u32 {
        self.inner.version_counter.current()
    }

    /// Records an in-place mutation of the tensor.
    ///
    /// Operator kernels call this after every in-place write so saved
    /// snapshots can detect the change.
    pub fn bump_version(&self) {
        self.inner.version_counter.bump();
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    /// Registers an accumulation hook, run when a gradient reaches this leaf.
    pub fn add_hook(&self, hook: Arc<dyn FunctionPreHook>) {
        self.inner.hooks.write().push(hook);
    }

    /// Returns the registered accumulation hooks.
    #[must_use]
    pub fn hooks(&self) -> Vec<Arc<dyn FunctionPreHook>> {
        self.inner.hooks.read().clone()
    }

    // =========================================================================
    // Grad Accumulator
    // =========================================================================

    /// Returns the leaf's gradient accumulator, creating it on first use.
    ///
    /// Non-leaf and non-requiring variables have none. The accumulator is
    /// cached through a weak reference — the graph edges referencing it are
    /// its strong owners — and creation is raced under a per-variable mutex.
    #[must_use]
    pub fn get_grad_accumulator(&self) -> Option<FnHandle> {
        if self.inner.grad_fn.is_some() || !self.inner.requires_grad {
            return None;
        }

        let mut slot = self.inner.grad_accumulator.lock();
        if let Some(existing) = slot.upgrade() {
            return Some(FnHandle::from_arc(existing));
        }

        let accumulator = Arc::new(AccumulateGrad::new(self));
        *slot = Arc::downgrade(&accumulator);
        Some(FnHandle::from_arc(accumulator))
    }

    pub(crate) fn grad_accumulator_weak(&self) -> Weak<AccumulateGrad> {
        self.inner.grad_accumulator.lock().clone()
    }

    /// Downgrades to a weak handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakVariable {
        WeakVariable {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variable")
            .field("shape", &self.data().shape().to_vec())
            .field("requires_grad", &self.inner.requires_grad)
            .field("is_volatile", &self.inner.is_volatile)
            .field("grad_fn", &self.inner.grad_fn.as_ref().map(FnHandle::name))
            .finish()
    }
}

/// Weak counterpart of [`Variable`], used by accumulator back-edges.
#[derive(Clone)]
pub struct WeakVariable {
    inner: Weak<VariableImpl>,
}

impl WeakVariable {
    /// Creates a reference that never upgrades.
    #[must_use]
    pub fn dangling() -> Self {
        Self { inner: Weak::new() }
    }

    /// Attempts to upgrade to a strong handle.
    #[must_use]
    pub fn upgrade(&self) -> Option<Variable> {
        self.inner.upgrade().map(|inner| Variable { inner })
    }
}

// =============================================================================
// Saved Variable
// =============================================================================

/// Snapshot of a variable captured during forward for replay in backward.
pub struct SavedVariable {
    data: Option<Tensor>,
    requires_grad: bool,
    is_volatile: bool,
    output_nr: usize,
    grad_fn: Option<FnHandle>,
    weak_grad_fn: Option<WeakFnHandle>,
    grad_accumulator: Weak<AccumulateGrad>,
    version: Arc<AtomicU32>,
    expected_version: u32,
}

impl SavedVariable {
    /// Captures `var` for later replay.
    ///
    /// `saved_for` is the function doing the saving: when a function saves
    /// one of its own outputs, the producer reference is kept weak so the
    /// node does not own itself through the snapshot.
    #[must_use]
    pub fn new(var: &Variable, saved_for: Option<&FnHandle>) -> Self {
        let grad_fn = var.grad_fn();
        let saves_own_output = match (&grad_fn, saved_for) {
            (Some(producer), Some(saving)) => producer.id() == saving.id(),
            _ => false,
        };

        let (strong, weak) = if saves_own_output {
            (None, grad_fn.as_ref().map(FnHandle::downgrade))
        } else {
            (grad_fn, None)
        };

        Self {
            data: Some(var.data()),
            requires_grad: var.requires_grad(),
            is_volatile: var.is_volatile(),
            output_nr: var.output_nr(),
            grad_fn: strong,
            weak_grad_fn: weak,
            grad_accumulator: var.grad_accumulator_weak(),
            version: var.inner.version_counter.snapshot(),
            expected_version: var.current_version(),
        }
    }

    /// Creates an empty snapshot that unpacks to `None`.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            data: None,
            requires_grad: false,
            is_volatile: false,
            output_nr: 0,
            grad_fn: None,
            weak_grad_fn: None,
            grad_accumulator: Weak::new(),
            version: Arc::new(AtomicU32::new(0)),
            expected_version: 0,
        }
    }

    /// Rebuilds the saved variable.
    ///
    /// Fails if the underlying tensor was mutated in place after the save,
    /// or if a saved leaf requiring grad lost its accumulator. The rebuilt
    /// variable shares the original's version cell, so later mutations stay
    /// observable through it.
    pub fn unpack(&self) -> Result<Option<Variable>> {
        let Some(data) = &self.data else {
            return Ok(None);
        };

        let current_version = self.version.load(Ordering::SeqCst);
        if current_version != self.expected_version {
            return Err(AutogradError::ModifiedByInplaceOperation);
        }

        let grad_fn = match (&self.grad_fn, &self.weak_grad_fn) {
            (None, Some(weak)) => weak.upgrade(),
            (strong, _) => strong.clone(),
        };

        // A saved leaf that requires grad must still be reachable through its
        // accumulator; the graph edges referencing the accumulator keep it
        // alive even after the variable itself is gone.
        if self.requires_grad && grad_fn.is_none() && self.grad_accumulator.strong_count() == 0 {
            return Err(AutogradError::MissingGradAccumulator);
        }

        Ok(Some(Variable::unpacked(
            data.clone_shallow(),
            grad_fn,
            self.requires_grad,
            self.is_volatile,
            self.output_nr,
            Arc::clone(&self.version),
            self.grad_accumulator.clone(),
        )))
    }

    /// Drops the saved tensor, turning this snapshot into an empty one.
    pub fn release(&mut self) {
        self.data = None;
    }
}

// =============================================================================
// Tests
// =============================================================================
