//! # Gradix - Reverse-Mode Autodiff Execution Engine in Pure Rust
//!
//! Gradix runs the backward half of a deep-learning framework: given a DAG
//! of differentiable operations recorded by a forward pass, it schedules the
//! corresponding backward functions across per-device worker threads and
//! accumulates gradients into leaf parameters.
//!
//! ## Core Pieces
//!
//! - **`Variable` / `SavedVariable`**: gradient-bearing tensor wrappers with
//!   version counters that catch in-place mutation of saved inputs
//! - **`Function`**: the backward graph node contract, with per-node hooks
//! - **`Engine`**: device-affine worker threads, ready queues, dependency
//!   counting, input-buffer reduction, and first-failure cancellation
//! - **`AccumulateGrad`**: the leaf sink that folds gradients into
//!   `variable.grad` with in-place vs out-of-place policy
//! - **`Tensor`**: the minimal dense/sparse carrier the engine reduces
//!
//! # Quick Start
//!
//! ```ignore
//! use gradix::prelude::*;
//!
//! // The operator library records a backward graph during forward...
//! let loss_grad = Variable::new(Tensor::scalar(1.0), false, true);
//!
//! // ...and the engine drives it to the leaves.
//! Engine::global().execute(&[(loss_root, 0)], &[loss_grad], false, Default::default())?;
//! ```
//!
//! @version 0.1.0
//! @author `Gradix` Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

// =============================================================================
// Re-exports
// =============================================================================

pub use gradix_autograd::{
    AccumulateGrad, AutogradError, Callback, CallbackMap, Edge, Engine, FnHandle, FnId, Function,
    FunctionFlags, FunctionMeta, FunctionPostHook, FunctionPreHook, InputBuffer, SavedVariable,
    VarList, Variable, VersionCounter, WeakFnHandle, WeakVariable,
};
pub use gradix_core::{accelerator_count, Device, Storage};
pub use gradix_tensor::{SparseIndex, Tensor};

// =============================================================================
// Prelude
// =============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use gradix_autograd::prelude::*;
    pub use gradix_core::Device;
    pub use gradix_tensor::Tensor;
}
