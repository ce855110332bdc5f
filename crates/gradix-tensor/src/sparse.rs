//! Sparse Tensor Support
//!
//! Sparse gradients are modeled as flat-index COO: the tensor's storage holds
//! only the non-zero values and a shared index lists their linear positions
//! within the logical shape. This is the minimum the gradient reducers need:
//! scatter-adds into a dense accumulator, and concatenation of two sparse
//! contributions (the result stays uncoalesced; densification sums
//! duplicates).
//!
//! @version 0.1.0
//! @author `Gradix` Development Team

use std::sync::Arc;

// =============================================================================
// Sparse Index
// =============================================================================

/// Linear positions of the stored values of a sparse tensor.
///
/// Shared between shallow clones of the same tensor; positions may repeat
/// (the tensor is then uncoalesced and densification sums duplicates).
#[derive(Debug, Clone)]
pub struct SparseIndex {
    positions: Arc<Vec<usize>>,
}

impl SparseIndex {
    /// Creates an index from linear positions.
    #[must_use]
    pub fn new(positions: Vec<usize>) -> Self {
        Self {
            positions: Arc::new(positions),
        }
    }

    /// Returns the number of stored values.
    #[must_use]
    pub fn nnz(&self) -> usize {
        self.positions.len()
    }

    /// Returns the linear positions of the stored values.
    #[must_use]
    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    /// Concatenates two indices, preserving order (left then right).
    #[must_use]
    pub fn concat(&self, other: &Self) -> Self {
        let mut positions = Vec::with_capacity(self.nnz() + other.nnz());
        positions.extend_from_slice(self.positions());
        positions.extend_from_slice(other.positions());
        Self::new(positions)
    }
}

// =============================================================================
// Tests
// =============================================================================
