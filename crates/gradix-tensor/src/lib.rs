//! Gradix Tensor - Gradient Carriers for the Gradix Autograd Engine
//!
//! A deliberately small tensor layer: flat `f32` tensors with shape, device
//! tag, and an optional sparse-COO index. It implements exactly the contract
//! the backward engine relies on — shallow clones that share storage,
//! in-place and out-of-place addition with sparse/dense promotion, zero
//! templates, and device retagging. Kernels, broadcasting, and views belong
//! to a full tensor library and are out of scope here.
//!
//! # Example
//! ```rust
//! use gradix_tensor::Tensor;
//!
//! let a = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
//! let b = a.clone_shallow();
//! a.add_(&Tensor::from_vec(vec![1.0, 1.0], &[2]).unwrap()).unwrap();
//! assert_eq!(b.to_vec(), vec![2.0, 3.0]);
//! ```
//!
//! @version 0.1.0
//! @author `Gradix` Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Engine-specific allowances
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::return_self_not_must_use)]

// =============================================================================
// Modules
// =============================================================================

pub mod sparse;
pub mod tensor;

// =============================================================================
// Re-exports
// =============================================================================

pub use gradix_core::{Device, Error, Result};
pub use sparse::SparseIndex;
pub use tensor::Tensor;

// =============================================================================
// Prelude
// =============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::sparse::SparseIndex;
    pub use crate::tensor::Tensor;
    pub use gradix_core::{Device, Error, Result};
}
