//! Tensor - Gradient Carrier Data Type
//!
//! A flat `f32` tensor with a shape, a device tag, and an optional sparse
//! index. Cloning a `Tensor` is shallow: the storage is shared, so an
//! in-place `add_` through one handle is observable through every snapshot
//! taken of it — the autograd version counters depend on exactly this.
//!
//! The operation set is the one the backward engine needs: out-of-place and
//! in-place addition in all dense/sparse combinations (with sparse-to-dense
//! promotion), deep and shallow clones, zero templates, and device retagging.
//!
//! @version 0.1.0
//! @author `Gradix` Development Team

use core::fmt;

use gradix_core::{Device, Error, Result, Storage};

use crate::sparse::SparseIndex;

// =============================================================================
// Tensor Struct
// =============================================================================

/// An N-dimensional array of `f32` values, dense or sparse-COO.
#[derive(Clone)]
pub struct Tensor {
    /// Dense values, or the packed non-zero values when sparse.
    storage: Storage,
    /// Logical shape of the tensor.
    shape: Vec<usize>,
    /// Linear positions of the stored values; `None` means dense.
    index: Option<SparseIndex>,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Creates a dense CPU tensor from a vector with the given shape.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        Self::from_vec_on(data, shape, Device::Cpu)
    }

    /// Creates a dense tensor from a vector, tagged with `device`.
    pub fn from_vec_on(data: Vec<f32>, shape: &[usize], device: Device) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(Error::shape_mismatch(&[numel], &[data.len()]));
        }
        Ok(Self {
            storage: Storage::from_vec(data, device),
            shape: shape.to_vec(),
            index: None,
        })
    }

    /// Creates a scalar (0-dimensional) tensor.
    #[must_use]
    pub fn scalar(value: f32) -> Self {
        Self {
            storage: Storage::from_vec(vec![value], Device::Cpu),
            shape: Vec::new(),
            index: None,
        }
    }

    /// Creates a dense tensor of zeros.
    #[must_use]
    pub fn zeros(shape: &[usize]) -> Self {
        Self::zeros_on(shape, Device::Cpu)
    }

    /// Creates a dense tensor of zeros on `device`.
    #[must_use]
    pub fn zeros_on(shape: &[usize], device: Device) -> Self {
        let numel = shape.iter().product();
        Self {
            storage: Storage::zeros(numel, device),
            shape: shape.to_vec(),
            index: None,
        }
    }

    /// Creates a dense zero tensor with this tensor's shape and device.
    #[must_use]
    pub fn zeros_like(&self) -> Self {
        Self::zeros_on(&self.shape, self.device())
    }

    /// Creates a sparse tensor from linear positions and their values.
    ///
    /// Positions may repeat; densification sums duplicates.
    pub fn sparse_coo(positions: Vec<usize>, values: Vec<f32>, shape: &[usize]) -> Result<Self> {
        Self::sparse_coo_on(positions, values, shape, Device::Cpu)
    }

    /// Creates a sparse tensor tagged with `device`.
    pub fn sparse_coo_on(
        positions: Vec<usize>,
        values: Vec<f32>,
        shape: &[usize],
        device: Device,
    ) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if positions.len() != values.len() {
            return Err(Error::shape_mismatch(&[positions.len()], &[values.len()]));
        }
        if let Some(&bad) = positions.iter().find(|&&p| p >= numel) {
            return Err(Error::IndexOutOfBounds {
                index: bad,
                size: numel,
            });
        }
        Ok(Self {
            storage: Storage::from_vec(values, device),
            shape: shape.to_vec(),
            index: Some(SparseIndex::new(positions)),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Returns the logical shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the total number of logical elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Returns the size in bytes of one element.
    #[must_use]
    pub fn element_size(&self) -> usize {
        core::mem::size_of::<f32>()
    }

    /// Returns the device this tensor is tagged with.
    #[must_use]
    pub fn device(&self) -> Device {
        self.storage.device()
    }

    /// Returns true if this tensor stores values sparsely.
    #[must_use]
    pub fn is_sparse(&self) -> bool {
        self.index.is_some()
    }

    /// Returns the number of stored values (nnz when sparse, numel when dense).
    #[must_use]
    pub fn stored_len(&self) -> usize {
        self.index
            .as_ref()
            .map_or_else(|| self.numel(), SparseIndex::nnz)
    }

    /// Returns true if two tensors share one storage allocation.
    #[must_use]
    pub fn shares_storage(&self, other: &Self) -> bool {
        self.storage.ptr_eq(&other.storage)
    }

    /// Materializes the tensor as a dense row-major vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<f32> {
        match &self.index {
            None => self.storage.as_slice().to_vec(),
            Some(index) => {
                let mut dense = vec![0.0; self.numel()];
                let values = self.storage.as_slice();
                for (&pos, &value) in index.positions().iter().zip(values.iter()) {
                    dense[pos] += value;
                }
                dense
            }
        }
    }

    /// Returns a dense tensor with the same contents, shape, and device.
    #[must_use]
    pub fn to_dense(&self) -> Self {
        match self.index {
            None => self.clone_shallow(),
            Some(_) => Self {
                storage: Storage::from_vec(self.to_vec(), self.device()),
                shape: self.shape.clone(),
                index: None,
            },
        }
    }

    // =========================================================================
    // Clones and Device Movement
    // =========================================================================

    /// Returns a handle sharing this tensor's storage.
    ///
    /// Writes through either handle are visible through the other.
    #[must_use]
    pub fn clone_shallow(&self) -> Self {
        self.clone()
    }

    /// Returns a copy with its own storage.
    #[must_use]
    pub fn deep_clone(&self) -> Self {
        Self {
            storage: self.storage.deep_copy(),
            shape: self.shape.clone(),
            index: self.index.clone(),
        }
    }

    /// Returns a copy of this tensor tagged with `device`.
    #[must_use]
    pub fn to_device(&self, device: Device) -> Self {
        if device == self.device() {
            return self.clone_shallow();
        }
        Self {
            storage: self.storage.deep_copy_on(device),
            shape: self.shape.clone(),
            index: self.index.clone(),
        }
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    /// Out-of-place elementwise sum, computed on this tensor's device.
    ///
    /// Density of the result: dense unless both operands are sparse, in which
    /// case the result is the uncoalesced sparse concatenation. A sparse
    /// operand meeting a dense one is promoted by scatter-adding into a dense
    /// copy.
    pub fn add(&self, other: &Self) -> Result<Self> {
        self.check_same_shape(other)?;
        match (&self.index, &other.index) {
            (None, None) => {
                let rhs = other.storage.as_slice().to_vec();
                let lhs = self.storage.as_slice();
                let sum = lhs.iter().zip(rhs.iter()).map(|(a, b)| a + b).collect();
                drop(lhs);
                Self::from_vec_on(sum, &self.shape, self.device())
            }
            (None, Some(_)) => {
                let out = self.deep_clone();
                out.scatter_add(other)?;
                Ok(out)
            }
            (Some(_), None) => {
                let out = Self {
                    storage: other.storage.deep_copy_on(self.device()),
                    shape: other.shape.clone(),
                    index: None,
                };
                out.scatter_add(self)?;
                Ok(out)
            }
            (Some(lhs_index), Some(rhs_index)) => {
                let mut values = self.storage.as_slice().to_vec();
                values.extend_from_slice(&other.storage.as_slice());
                Ok(Self {
                    storage: Storage::from_vec(values, self.device()),
                    shape: self.shape.clone(),
                    index: Some(lhs_index.concat(rhs_index)),
                })
            }
        }
    }

    /// In-place elementwise sum into this tensor.
    ///
    /// The destination must be dense; a sparse right-hand side is
    /// scatter-added.
    pub fn add_(&self, other: &Self) -> Result<()> {
        if self.is_sparse() {
            return Err(Error::invalid_operation(
                "in-place add requires a dense destination tensor",
            ));
        }
        self.check_same_shape(other)?;
        match &other.index {
            None => {
                let rhs = other.storage.as_slice().to_vec();
                let mut lhs = self.storage.as_slice_mut();
                for (a, b) in lhs.iter_mut().zip(rhs.iter()) {
                    *a += b;
                }
                Ok(())
            }
            Some(_) => self.scatter_add(other),
        }
    }

    /// Overwrites every element with `value`.
    pub fn fill_(&self, value: f32) -> Result<()> {
        if self.is_sparse() {
            return Err(Error::invalid_operation(
                "fill requires a dense destination tensor",
            ));
        }
        for v in self.storage.as_slice_mut().iter_mut() {
            *v = value;
        }
        Ok(())
    }

    /// Adds the stored values of `sparse` into this dense tensor.
    fn scatter_add(&self, sparse: &Self) -> Result<()> {
        let index = sparse.index.as_ref().ok_or_else(|| {
            Error::invalid_operation("scatter add requires a sparse right-hand side")
        })?;
        let values = sparse.storage.as_slice().to_vec();
        let mut dense = self.storage.as_slice_mut();
        for (&pos, &value) in index.positions().iter().zip(values.iter()) {
            dense[pos] += value;
        }
        Ok(())
    }

    fn check_same_shape(&self, other: &Self) -> Result<()> {
        if self.shape != other.shape {
            return Err(Error::shape_mismatch(&self.shape, &other.shape));
        }
        Ok(())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("device", &self.device())
            .field("sparse", &self.is_sparse())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
