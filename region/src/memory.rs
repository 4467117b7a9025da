use alloc::vec;
use alloc::vec::Vec;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegionError {
    #[error("cannot grow region to {requested} bytes, limit is {limit}")]
    LimitExceeded { requested: usize, limit: usize },
    #[error("cannot shrink region from {current} to {requested} bytes")]
    Shrink { current: usize, requested: usize },
}

/// Backing store for a heap region.
///
/// Growth must keep every existing byte at its offset. Implementations may
/// move the bytes in memory, so nobody holds on to a slice across `grow`.
pub trait RegionProvider {
    fn current_size(&self) -> usize;
    fn grow(&mut self, new_size: usize) -> Result<(), RegionError>;
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];
}

pub struct VecRegion {
    bytes: Vec<u8>,
    limit: usize,
}

impl VecRegion {
    /// A region that never grows.
    pub fn new(size: usize) -> Self {
        Self::growable(size, size)
    }

    pub fn growable(size: usize, limit: usize) -> Self {
        VecRegion {
            bytes: vec![0; size],
            limit: limit.max(size),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl RegionProvider for VecRegion {
    fn current_size(&self) -> usize {
        self.bytes.len()
    }

    fn grow(&mut self, new_size: usize) -> Result<(), RegionError> {
        let current = self.bytes.len();
        if new_size < current {
            return Err(RegionError::Shrink { current, requested: new_size });
        }
        if new_size > self.limit {
            return Err(RegionError::LimitExceeded { requested: new_size, limit: self.limit });
        }
        self.bytes.resize(new_size, 0);
        Ok(())
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}
