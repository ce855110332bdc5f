//! Storage - Reference-Counted Tensor Memory
//!
//! A contiguous `f32` buffer with a device tag. Storage is reference-counted:
//! cloning shares the underlying allocation, which is what gives tensors
//! their shallow-clone semantics (an in-place write through one handle is
//! visible through every other handle). `deep_copy` breaks the sharing.
//!
//! # Example
//! ```rust
//! use gradix_core::{Device, Storage};
//!
//! let storage = Storage::zeros(8, Device::Cpu);
//! assert_eq!(storage.len(), 8);
//! ```
//!
//! @version 0.1.0
//! @author `Gradix` Development Team

use core::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::device::Device;

// =============================================================================
// Storage Struct
// =============================================================================

/// Reference-counted memory backing a tensor.
#[derive(Debug)]
pub struct Storage {
    inner: Arc<RwLock<StorageInner>>,
}

#[derive(Debug)]
struct StorageInner {
    data: Vec<f32>,
    device: Device,
}

impl Storage {
    /// Creates new storage of the given length, initialized to zero.
    #[must_use]
    pub fn zeros(len: usize, device: Device) -> Self {
        Self::from_vec(vec![0.0; len], device)
    }

    /// Creates storage from an existing vector.
    #[must_use]
    pub fn from_vec(data: Vec<f32>, device: Device) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StorageInner { data, device })),
        }
    }

    /// Returns the number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().data.len()
    }

    /// Returns true if the storage holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the device this storage is tagged with.
    #[must_use]
    pub fn device(&self) -> Device {
        self.inner.read().device
    }

    /// Returns true if this storage is uniquely owned (not shared).
    #[must_use]
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    /// Returns true if two handles share one allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns a read guard over the data.
    #[must_use]
    pub fn as_slice(&self) -> StorageReadGuard<'_> {
        StorageReadGuard {
            guard: self.inner.read(),
        }
    }

    /// Returns a write guard over the data.
    #[must_use]
    pub fn as_slice_mut(&self) -> StorageWriteGuard<'_> {
        StorageWriteGuard {
            guard: self.inner.write(),
        }
    }

    /// Makes a deep copy of this storage on the same device.
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        self.deep_copy_on(self.device())
    }

    /// Makes a deep copy of this storage tagged with `device`.
    #[must_use]
    pub fn deep_copy_on(&self, device: Device) -> Self {
        let data = self.as_slice().to_vec();
        Self::from_vec(data, device)
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

// =============================================================================
// Guard Types for Safe Access
// =============================================================================

/// Read guard for storage data.
pub struct StorageReadGuard<'a> {
    guard: parking_lot::RwLockReadGuard<'a, StorageInner>,
}

impl Deref for StorageReadGuard<'_> {
    type Target = [f32];

    fn deref(&self) -> &Self::Target {
        &self.guard.data
    }
}

/// Write guard for storage data.
pub struct StorageWriteGuard<'a> {
    guard: parking_lot::RwLockWriteGuard<'a, StorageInner>,
}

impl Deref for StorageWriteGuard<'_> {
    type Target = [f32];

    fn deref(&self) -> &Self::Target {
        &self.guard.data
    }
}

impl DerefMut for StorageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard.data
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_zeros() {
        let storage = Storage::zeros(10, Device::Cpu);
        assert_eq!(storage.len(), 10);
        assert!(storage.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_storage_clone_shares() {
        let storage1 = Storage::from_vec(vec![1.0, 2.0], Device::Cpu);
        let storage2 = storage1.clone();
        assert!(!storage1.is_unique());
        assert!(storage1.ptr_eq(&storage2));

        storage2.as_slice_mut()[0] = 9.0;
        assert_eq!(storage1.as_slice()[0], 9.0);
    }

    #[test]
    fn test_storage_deep_copy() {
        let storage1 = Storage::from_vec(vec![1.0, 2.0, 3.0], Device::Cpu);
        let storage2 = storage1.deep_copy();
        assert!(!storage1.ptr_eq(&storage2));

        storage2.as_slice_mut()[0] = 99.0;
        assert_eq!(storage1.as_slice()[0], 1.0);
    }

    #[test]
    fn test_storage_deep_copy_on_device() {
        let storage = Storage::from_vec(vec![1.0], Device::Cpu);
        let moved = storage.deep_copy_on(Device::Cuda(0));
        assert_eq!(moved.device(), Device::Cuda(0));
        assert_eq!(storage.device(), Device::Cpu);
    }
}
