use core::ops::{Deref, DerefMut};

use log::warn;
use region::{RegionProvider, VecRegion};

use crate::error::Result;
use crate::heap::{Block, LocalHeap};

/// Keeps a block locked for as long as it lives and derefs to its payload.
pub struct LockGuard<'h, R: RegionProvider = VecRegion> {
    heap: &'h mut LocalHeap<R>,
    block: Block,
    offset: usize,
    len: usize,
}

impl<R: RegionProvider> LockGuard<'_, R> {
    pub fn block(&self) -> Block {
        self.block
    }

    /// Payload offset, stable until the guard is dropped.
    pub fn offset(&self) -> u32 {
        self.offset as u32
    }
}

impl<R: RegionProvider> Deref for LockGuard<'_, R> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.heap.region.bytes()[self.offset..self.offset + self.len]
    }
}

impl<R: RegionProvider> DerefMut for LockGuard<'_, R> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.heap.region.bytes_mut()[self.offset..self.offset + self.len]
    }
}

impl<R: RegionProvider> Drop for LockGuard<'_, R> {
    fn drop(&mut self) {
        if let Err(e) = self.heap.unlock(self.block) {
            warn!("[localheap] unlock on guard drop failed: {}", e);
        }
    }
}

impl<R: RegionProvider> LocalHeap<R> {
    pub fn lock_guard(&mut self, block: Block) -> Result<LockGuard<'_, R>> {
        self.lock(block)?;
        let (offset, len) = self.payload(block)?;
        Ok(LockGuard { heap: self, block, offset, len })
    }
}
