//! Error Types - Autograd Engine Error Handling
//!
//! Faults surfaced by the backward engine. Three families share one enum:
//! invariant violations (arity mismatch, missing dependency entries,
//! unreachable functions at completion), user errors (empty executable graph,
//! in-place misuse of saved or leaf variables), and tensor-level failures
//! bubbled up from `gradix-core`.
//!
//! @version 0.1.0
//! @author `Gradix` Development Team

use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// The error type for backward-graph execution.
#[derive(Error, Debug)]
pub enum AutogradError {
    /// No executable root and no stochastic node was seeded.
    #[error("there are no graph nodes that require computing gradients")]
    NoExecutableGraph,

    /// Functions were left waiting for inputs after all tasks drained.
    #[error("could not compute gradients for some functions")]
    UnreachableFunctions,

    /// An edge pointed at a function missing from the dependency map.
    #[error("dependency not found for {name}")]
    DependencyNotFound {
        /// Name of the function the edge pointed at.
        name: String,
    },

    /// A function produced a gradient list of the wrong arity.
    #[error("Function '{name}' returned an invalid number of outputs - expected {expected}, but got {actual}")]
    InvalidOutputCount {
        /// Name of the offending function.
        name: String,
        /// `next_functions` edge count.
        expected: usize,
        /// Number of outputs actually returned.
        actual: usize,
    },

    /// A saved variable was mutated between forward and backward.
    #[error("one of the variables needed for gradient computation has been modified by an inplace operation")]
    ModifiedByInplaceOperation,

    /// A saved leaf lost its grad accumulator.
    #[error("No grad accumulator for a saved leaf!")]
    MissingGradAccumulator,

    /// A leaf variable acquired a `grad_fn` after its accumulator was built.
    #[error("leaf variable has been moved into the graph interior")]
    LeafMovedIntoInterior,

    /// A leaf variable was mutated in place before accumulation.
    #[error("leaf variable was used in an inplace operation")]
    LeafUsedInplace,

    /// An `AccumulateGrad` was asked to serve a variable it is not bound to.
    #[error("AccumulateGrad's variable is not bound to it")]
    AccumulatorNotBound,

    /// `AccumulateGrad` received a gradient list of the wrong arity.
    #[error("AccumulateGrad expects exactly 1 input")]
    AccumulateGradArity,

    /// A tensor operation failed during gradient reduction.
    #[error(transparent)]
    Tensor(#[from] gradix_core::Error),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

// =============================================================================
// Result Type
// =============================================================================

/// A specialized Result type for autograd operations.
pub type Result<T> = core::result::Result<T, AutogradError>;

// =============================================================================
// Helper Functions
// =============================================================================

impl AutogradError {
    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
