//! Built-in Functions - Gradient Reduction Nodes
//!
//! The handful of concrete `Function` nodes the engine itself needs:
//! `AccumulateGrad` lives in its own module; here are the reduction helpers
//! it composes with. Operator backward nodes come from the operator library.
//!
//! @version 0.1.0
//! @author `Gradix` Development Team

pub mod basic;

pub use basic::{Add, CloneFn};
