#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod memory;

pub use memory::{RegionError, RegionProvider, VecRegion};
