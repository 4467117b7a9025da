use thiserror::Error;

use crate::handle_table::Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("out of memory: no free arena for {requested} bytes")]
    Exhausted { requested: usize },
    #[error("invalid handle {0}")]
    InvalidHandle(Handle),
    #[error("no live fixed block at offset {0:#x}")]
    InvalidAddress(u32),
    #[error("block at offset {0:#x} is already free")]
    DoubleFree(u32),
    #[error("block behind {0} has been discarded")]
    Discarded(Handle),
    #[error("block cannot grow to {requested} bytes without moving")]
    MoveRefused { requested: usize },
    #[error("block behind {0} is locked")]
    Locked(Handle),
    #[error("{0} is not locked")]
    NotLocked(Handle),
    #[error("region of {size} bytes is smaller than the {required} bytes a heap needs")]
    RegionTooSmall { size: usize, required: usize },
    #[error("region of {size} bytes exceeds the addressable {limit} bytes")]
    RegionTooLarge { size: usize, limit: usize },
    #[error("heap corrupted near offset {offset:#x}")]
    Corrupted { offset: u32 },
}

pub type Result<T> = core::result::Result<T, HeapError>;
