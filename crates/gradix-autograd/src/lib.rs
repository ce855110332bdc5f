//! Gradix Autograd - Reverse-Mode Differentiation Execution Engine
//!
//! Given a backward DAG built by an operator library, this crate schedules
//! and runs the gradient computation: device-affine worker threads pop ready
//! functions, reduce their outputs into successors' input buffers, and
//! accumulate leaf gradients through `AccumulateGrad`. The public surface is
//! the `Variable`/`SavedVariable` gradient carriers, the `Function` node
//! contract, and `Engine::execute`.
//!
//! # Example
//! ```rust
//! use gradix_autograd::{Engine, FnHandle, Function, FunctionFlags, FunctionMeta, Variable, VarList};
//! use gradix_tensor::Tensor;
//!
//! // A pass-through backward node wired straight to a leaf's accumulator.
//! struct Identity { meta: FunctionMeta }
//! impl Function for Identity {
//!     fn meta(&self) -> &FunctionMeta { &self.meta }
//!     fn apply(&self, inputs: VarList) -> gradix_autograd::Result<VarList> { Ok(inputs) }
//!     fn name(&self) -> String { "Identity".into() }
//! }
//!
//! let leaf = Variable::new(Tensor::scalar(0.0), true, false);
//! let meta = FunctionMeta::from_flags(FunctionFlags::of(&[leaf.clone()]));
//! meta.set_num_inputs(1);
//! let node = FnHandle::new(Identity { meta });
//!
//! let upstream = Variable::new(Tensor::scalar(1.0), false, true);
//! Engine::global()
//!     .execute(&[(node, 0)], &[upstream], false, Default::default())
//!     .unwrap();
//! assert_eq!(leaf.grad().unwrap().data().to_vec(), vec![1.0]);
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

pub mod accumulate_grad;
pub mod engine;
pub mod error;
pub mod function;
pub mod functions;
pub mod input_buffer;
pub mod variable;

// =============================================================================
// Re-exports
// =============================================================================

pub use accumulate_grad::AccumulateGrad;
pub use engine::{Callback, CallbackMap, Engine};
pub use error::{AutogradError, Result};
pub use function::{
    Edge, FnHandle, FnId, Function, FunctionFlags, FunctionMeta, FunctionPostHook,
    FunctionPreHook, VarList, WeakFnHandle,
};
pub use input_buffer::InputBuffer;
pub use variable::{SavedVariable, Variable, VersionCounter, WeakVariable};

// =============================================================================
// Prelude
// =============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::engine::{CallbackMap, Engine};
    pub use crate::error::{AutogradError, Result};
    pub use crate::function::{Edge, FnHandle, Function, FunctionFlags, FunctionMeta, VarList};
    pub use crate::variable::{SavedVariable, Variable};
}
