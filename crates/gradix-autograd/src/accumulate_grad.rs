//! Accumulate Grad - Leaf Gradient Sink
//!
//! One `AccumulateGrad` exists per leaf variable that requires grad; it is
//! the terminal node every gradient path ends in. It merges each arriving
//! gradient into `variable.grad`: the first contribution is deep-cloned so
//! the leaf never shares storage with an incoming gradient, a volatile grad
//! is summed in place, and a non-volatile grad is replaced by an
//! out-of-place sum.
//!
//! Not thread-safe. The engine's device affinity is what makes this sound:
//! every task producing gradients for one leaf runs on the same worker
//! thread, so `apply` is never entered concurrently.
//!
//! @version 0.1.0
//! @author `Gradix` Development Team

use parking_lot::Mutex;

use crate::error::{AutogradError, Result};
use crate::function::{Function, FunctionMeta, VarList};
use crate::functions::basic::{Add, CloneFn};
use crate::variable::{Variable, WeakVariable};

// =============================================================================
// AccumulateGrad
// =============================================================================

/// Terminal node that folds incoming gradients into a leaf's `grad`.
///
/// Holds only weak references: the accumulator must not keep its variable
/// (or that variable's previous grad) alive — the graph edges pointing at
/// the accumulator are its strong owners, not the other way around.
pub struct AccumulateGrad {
    meta: FunctionMeta,
    variable: WeakVariable,
    variable_grad: Mutex<WeakVariable>,
}

impl AccumulateGrad {
    /// Creates the accumulator for `variable`.
    ///
    /// Normally reached through `Variable::get_grad_accumulator`, which
    /// caches the result on the variable.
    #[must_use]
    pub fn new(variable: &Variable) -> Self {
        let meta = FunctionMeta::new(variable.requires_grad(), false);
        meta.set_num_inputs(1);
        let variable_grad = variable
            .grad()
            .map_or_else(WeakVariable::dangling, |grad| grad.downgrade());
        Self {
            meta,
            variable: variable.downgrade(),
            variable_grad: Mutex::new(variable_grad),
        }
    }

    /// Sums `new_grad` into `grad` in place, promoting a sparse `grad` to
    /// dense when the incoming gradient is dense.
    fn acc_inplace(grad: &Variable, new_grad: &Variable) -> Result<()> {
        let grad_data = grad.data();
        let new_data = new_grad.data();

        if grad_data.is_sparse() && !new_data.is_sparse() {
            let mut result = new_data.add(&grad_data)?;
            if result.device() != grad_data.device() {
                result = result.to_device(grad_data.device());
            }
            grad.set_data(result);
        } else if grad_data.is_sparse() {
            grad.set_data(grad_data.add(&new_data)?);
        } else {
            grad_data.add_(&new_data)?;
        }
        Ok(())
    }
}

impl Function for AccumulateGrad {
    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    // XXX: not thread-safe; see the module docs.
    fn apply(&self, grads: VarList) -> Result<VarList> {
        if grads.len() != 1 {
            return Err(AutogradError::AccumulateGradArity);
        }
        let Some(mut new_grad) = grads.into_iter().next().flatten() else {
            return Err(AutogradError::AccumulateGradArity);
        };

        let Some(var) = self.variable.upgrade() else {
            // The variable went out of scope mid-backward. If someone still
            // holds its grad and both sides are volatile, accumulate in
            // place; otherwise there is no way to hand a new value to a
            // caller that lost the variable, so drop the gradient.
            let var_grad = self.variable_grad.lock().upgrade();
            let Some(var_grad) = var_grad else {
                return Ok(Vec::new());
            };
            if !var_grad.is_volatile() || !new_grad.is_volatile() {
                return Ok(Vec::new());
            }
            Self::acc_inplace(&var_grad, &new_grad)?;
            return Ok(Vec::new());
        };

        if var.grad_fn().is_some() {
            return Err(AutogradError::LeafMovedIntoInterior);
        }
        if var.current_version() != 0 {
            return Err(AutogradError::LeafUsedInplace);
        }
        let self_id = (self as *const Self).cast::<()>() as usize;
        match var.get_grad_accumulator() {
            Some(bound) if bound.id() == self_id => {}
            _ => return Err(AutogradError::AccumulatorNotBound),
        }

        for hook in var.hooks() {
            new_grad = hook
                .call(vec![Some(new_grad)])?
                .into_iter()
                .next()
                .flatten()
                .ok_or_else(|| AutogradError::internal("accumulation hook dropped the gradient"))?;
        }

        match var.grad() {
            None => {
                let cloned = CloneFn::new()
                    .apply(vec![Some(new_grad)])?
                    .into_iter()
                    .next()
                    .flatten()
                    .ok_or_else(|| AutogradError::internal("Clone produced no output"))?;
                *self.variable_grad.lock() = cloned.downgrade();
                var.set_grad(cloned);
            }
            // In-place accumulation keeps the grad tensor stable for
            // first-order use; it only applies while the grad is volatile.
            Some(grad) if grad.is_volatile() => Self::acc_inplace(&grad, &new_grad)?,
            Some(grad) => {
                // Once the grad becomes non-volatile, it stays that way.
                if new_grad.is_volatile() {
                    new_grad = Variable::new(new_grad.data().clone_shallow(), false, false);
                }
                let sum = Add::new()
                    .apply(vec![Some(grad), Some(new_grad)])?
                    .into_iter()
                    .next()
                    .flatten()
                    .ok_or_else(|| AutogradError::internal("Add produced no output"))?;
                var.set_grad(sum);
            }
        }

        Ok(Vec::new())
    }

    fn name(&self) -> String {
        "AccumulateGrad".into()
    }
}

// =============================================================================
// Tests
// =============================================================================
