use region::VecRegion;

use crate::config::HeapConfig;
use crate::heap::LocalHeap;

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn heap(size: usize) -> LocalHeap {
    heap_with(size, HeapConfig::default())
}

pub(crate) fn heap_with(size: usize, config: HeapConfig) -> LocalHeap {
    init_logging();
    LocalHeap::with_config(VecRegion::new(size), config).unwrap()
}

pub(crate) fn growable_heap(size: usize, limit: usize) -> LocalHeap {
    init_logging();
    LocalHeap::new(VecRegion::growable(size, limit)).unwrap()
}

/// Linear congruential generator, deterministic across runs.
pub(crate) struct SimpleRng {
    state: u32,
}

impl SimpleRng {
    pub(crate) fn new(seed: u32) -> Self {
        SimpleRng { state: seed }
    }

    pub(crate) fn next(&mut self) -> u32 {
        self.state = self.state.wrapping_mul(1103515245).wrapping_add(12345);
        self.state >> 8
    }

    pub(crate) fn next_range(&mut self, min: u32, max: u32) -> u32 {
        let range = max - min + 1;
        min + (self.next() % range)
    }
}
