//! Gradix Core - Foundation Layer for the Gradix Autograd Engine
//!
//! This crate provides the abstractions underneath the Gradix tensor and
//! autograd crates: device identity, reference-counted storage, and the
//! unified tensor-level error type.
//!
//! # Key Features
//! - Device abstraction (CPU plus CUDA scheduling tags)
//! - Reference-counted `f32` storage with shallow-clone semantics
//! - `thiserror`-based error type shared across the workspace
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

pub mod device;
pub mod error;
pub mod storage;

// =============================================================================
// Re-exports
// =============================================================================

pub use device::{accelerator_count, Device};
pub use error::{Error, Result};
pub use storage::Storage;

// =============================================================================
// Prelude
// =============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::device::{accelerator_count, Device};
    pub use crate::error::{Error, Result};
    pub use crate::storage::Storage;
}
