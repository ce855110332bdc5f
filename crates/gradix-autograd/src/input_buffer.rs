//! Input Buffer - Per-Node Gradient Fan-In
//!
//! Collects the gradients arriving at one function's input slots while its
//! dependency count drains. Multi-producer edges land in the same slot and
//! are reduced immediately: the slot is replaced by the out-of-place sum,
//! computed on the device of the earlier contribution. The buffer's device
//! (the device of its first populated slot) decides which worker thread
//! eventually runs the function.
//!
//! @version 0.1.0
//! @author `Gradix` Development Team

use gradix_core::Device;

use crate::error::{AutogradError, Result};
use crate::function::VarList;
use crate::variable::Variable;

// =============================================================================
// Input Buffer
// =============================================================================

/// Fixed-size gradient accumulator for one function's inputs.
#[derive(Debug)]
pub struct InputBuffer {
    buffer: VarList,
}

impl InputBuffer {
    /// Creates a buffer with `size` empty slots.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            buffer: vec![None; size],
        }
    }

    /// Returns the number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if the buffer has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Places `var` into slot `pos`, summing with any earlier contribution.
    ///
    /// An empty incoming gradient is a no-op: absent edges and suppressed
    /// propagations deliver nothing, but still count toward readiness. The
    /// sum is out-of-place on the earlier contribution's device, with
    /// sparse/dense promotion; it is volatile only if both contributions are.
    pub fn add(&mut self, pos: usize, var: Option<Variable>) -> Result<()> {
        let Some(var) = var else {
            return Ok(());
        };
        let size = self.buffer.len();
        let slot = self
            .buffer
            .get_mut(pos)
            .ok_or_else(|| AutogradError::internal(format!("gradient slot {pos} out of range for buffer of {size}")))?;

        match slot.take() {
            None => *slot = Some(var),
            Some(existing) => {
                let sum = existing.data().add(&var.data())?;
                let is_volatile = existing.is_volatile() && var.is_volatile();
                *slot = Some(Variable::new(sum, false, is_volatile));
            }
        }
        Ok(())
    }

    /// Returns the device of the first populated slot, or the host.
    #[must_use]
    pub fn device(&self) -> Device {
        self.buffer
            .iter()
            .flatten()
            .next()
            .map_or(Device::Cpu, |var| var.data().device())
    }

    /// Consumes the buffer, yielding the gradient list for `apply`.
    #[must_use]
    pub fn variables(self) -> VarList {
        self.buffer
    }
}

// =============================================================================
// Tests
// =============================================================================
