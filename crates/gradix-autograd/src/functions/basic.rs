//! Basic Functions - Elementwise Reduction Ops
//!
//! `Add` and `CloneFn` are the two operations gradient accumulation is built
//! from: summing a new contribution into an existing gradient, and deep
//! copying the first contribution so a leaf's `grad` never shares storage
//! with an incoming gradient. Both are ordinary graph nodes and can be wired
//! into a backward graph like any operator-supplied function.
//!
//! @version 0.1.0
//! @author `Gradix` Development Team

use crate::error::{AutogradError, Result};
use crate::function::{Function, FunctionMeta, VarList};
use crate::variable::Variable;

/// Unwraps a gradient list, requiring exactly `expected` populated slots.
fn check_input_variables(name: &str, inputs: VarList, expected: usize) -> Result<Vec<Variable>> {
    if inputs.len() != expected {
        return Err(AutogradError::internal(format!(
            "{name} expects {expected} inputs, got {}",
            inputs.len()
        )));
    }
    inputs
        .into_iter()
        .enumerate()
        .map(|(i, var)| {
            var.ok_or_else(|| AutogradError::internal(format!("{name} is missing input {i}")))
        })
        .collect()
}

// =============================================================================
// Add
// =============================================================================

/// Elementwise sum of two variables, with sparse/dense promotion.
///
/// The result is computed on the first operand's device and is volatile if
/// either operand is.
pub struct Add {
    meta: FunctionMeta,
}

impl Add {
    /// Creates an `Add` node.
    #[must_use]
    pub fn new() -> Self {
        Self {
            meta: FunctionMeta::new(false, false),
        }
    }
}

impl Default for Add {
    fn default() -> Self {
        Self::new()
    }
}

impl Function for Add {
    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn apply(&self, inputs: VarList) -> Result<VarList> {
        let mut vars = check_input_variables("Add", inputs, 2)?.into_iter();
        let lhs = vars.next().expect("checked arity");
        let rhs = vars.next().expect("checked arity");
        let sum = lhs.data().add(&rhs.data())?;
        let is_volatile = lhs.is_volatile() || rhs.is_volatile();
        Ok(vec![Some(Variable::new(sum, false, is_volatile))])
    }

    fn name(&self) -> String {
        "Add".into()
    }
}

// =============================================================================
// CloneFn
// =============================================================================

/// Deep copy of a variable: the output owns fresh storage.
pub struct CloneFn {
    meta: FunctionMeta,
}

impl CloneFn {
    /// Creates a `CloneFn` node.
    #[must_use]
    pub fn new() -> Self {
        Self {
            meta: FunctionMeta::new(false, false),
        }
    }
}

impl Default for CloneFn {
    fn default() -> Self {
        Self::new()
    }
}

impl Function for CloneFn {
    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn apply(&self, inputs: VarList) -> Result<VarList> {
        let mut vars = check_input_variables("Clone", inputs, 1)?.into_iter();
        let input = vars.next().expect("checked arity");
        let copied = input.data().deep_clone();
        Ok(vec![Some(Variable::new(copied, false, input.is_volatile()))])
    }

    fn name(&self) -> String {
        "Clone".into()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use gradix_tensor::Tensor;

    fn var(values: Vec<f32>, is_volatile: bool) -> Variable {
        let len = values.len();
        Variable::new(
            Tensor::from_vec(values, &[len]).unwrap(),
            false,
            is_volatile,
        )
    }

    #[test]
    fn test_add_sums() {
        let out = Add::new()
            .apply(vec![Some(var(vec![1.0, 2.0], true)), Some(var(vec![3.0, 4.0], true))])
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap().data().to_vec(), vec![4.0, 6.0]);
    }

    #[test]
    fn test_add_volatility_merges() {
        let out = Add::new()
            .apply(vec![Some(var(vec![1.0], false)), Some(var(vec![2.0], true))])
            .unwrap();
        assert!(out[0].as_ref().unwrap().is_volatile());
    }

    #[test]
    fn test_add_rejects_missing_input() {
        assert!(Add::new().apply(vec![Some(var(vec![1.0], true)), None]).is_err());
        assert!(Add::new().apply(vec![Some(var(vec![1.0], true))]).is_err());
    }

    #[test]
    fn test_clone_owns_storage() {
        let input = var(vec![1.0, 2.0], true);
        let out = CloneFn::new().apply(vec![Some(input.clone())]).unwrap();
        let cloned = out[0].as_ref().unwrap();
        assert_eq!(cloned.data().to_vec(), vec![1.0, 2.0]);
        assert!(!cloned.data().shares_storage(&input.data()));
        assert!(cloned.is_volatile());
    }
}
