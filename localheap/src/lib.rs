#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arena;
mod compact;
pub mod config;
pub mod error;
mod free_list;
mod guard;
pub mod handle_table;
pub mod heap;
mod integrity;
pub mod layout;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
mod test_support;

pub use arena::{ArenaInfo, ArenaIter, ArenaKind};
pub use config::HeapConfig;
pub use error::{HeapError, Result};
pub use guard::LockGuard;
pub use handle_table::Handle;
pub use heap::{AllocFlags, Block, BlockFlags, LocalHeap, ReallocFlags};
pub use integrity::HeapStats;
pub use region::{RegionError, RegionProvider, VecRegion};
