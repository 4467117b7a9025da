use alloc::vec::Vec;

use region::RegionProvider;

use crate::error::HeapError;
use crate::heap::{AllocFlags, Block, ReallocFlags};
use crate::test_support::{heap, SimpleRng};
use crate::{Handle, LocalHeap};

fn handle(block: Block) -> Handle {
    match block {
        Block::Moveable(handle) => handle,
        Block::Fixed(addr) => panic!("expected a handle, got fixed {:#x}", addr),
    }
}

#[test]
fn fixed_alloc_free_restores_largest_free() {
    let mut heap = heap(65536);
    let before = heap.stats().unwrap().largest_free;
    let block = heap.alloc(100, AllocFlags::FIXED).unwrap();
    let size = heap.size(block).unwrap();
    assert!((100..108).contains(&size));
    heap.free(block).unwrap();
    assert_eq!(heap.stats().unwrap().largest_free, before);
    assert_eq!(before, 65536 - 48 - 8);
    heap.check_integrity().unwrap();
}

#[test]
fn freed_moveable_arena_is_reused_first() {
    let mut heap = heap(65536);
    let h1 = heap.alloc(4096, AllocFlags::MOVEABLE).unwrap();
    let h2 = heap.alloc(4096, AllocFlags::MOVEABLE).unwrap();
    let h3 = heap.alloc(4096, AllocFlags::MOVEABLE).unwrap();
    let old = heap.resolve(handle(h2)).unwrap();

    heap.free(h2).unwrap();
    let h4 = heap.alloc(4096, AllocFlags::MOVEABLE).unwrap();
    assert_eq!(heap.resolve(handle(h4)).unwrap(), old);
    assert_eq!(heap.region().current_size(), 65536);
    assert!(heap.resolve(handle(h1)).is_ok());
    assert!(heap.resolve(handle(h3)).is_ok());
    heap.check_integrity().unwrap();
}

#[test]
fn full_heap_discards_to_satisfy_allocation() {
    let mut heap = heap(8192);
    let mut blocks = Vec::new();
    loop {
        match heap.alloc(200, AllocFlags::MOVEABLE) {
            Ok(block) => blocks.push(block),
            Err(HeapError::Exhausted { .. }) => break,
            Err(e) => panic!("unexpected error {}", e),
        }
    }
    assert!(blocks.len() >= 4);

    let discardable: Vec<Block> = blocks.iter().copied().step_by(2).collect();
    for &block in &discardable {
        heap.set_discardable(handle(block), true).unwrap();
    }

    let fixed = heap.alloc(400, AllocFlags::FIXED).unwrap();
    assert!(heap.size(fixed).unwrap() >= 400);
    for &block in &discardable {
        let h = handle(block);
        assert_eq!(heap.resolve(h), Err(HeapError::Discarded(h)));
    }
    for block in blocks.iter().copied().skip(1).step_by(2) {
        assert!(heap.resolve(handle(block)).is_ok());
    }

    let restored = discardable[0];
    heap.free(fixed).unwrap();
    heap.realloc(restored, 200, ReallocFlags::IN_PLACE).unwrap();
    assert!(heap.resolve(handle(restored)).is_ok());
    heap.check_integrity().unwrap();
}

#[test]
fn locked_fixed_block_is_not_relocated_by_realloc() {
    let mut heap = heap(4096);
    let block = heap.alloc(100, AllocFlags::FIXED).unwrap();
    let _fence = heap.alloc(16, AllocFlags::FIXED).unwrap();
    let addr = heap.lock(block).unwrap();
    assert_eq!(
        heap.realloc(block, 1000, ReallocFlags::IN_PLACE),
        Err(HeapError::MoveRefused { requested: 1000 })
    );
    assert_eq!(heap.handle_of(addr), Ok(block));
    assert_eq!(heap.size(block).unwrap(), 104);
    heap.unlock(block).unwrap();
}

#[test]
fn arena_spans_always_cover_the_region() {
    let mut heap = crate::test_support::growable_heap(1024, 1 << 20);
    let mut live = Vec::new();
    for size in [10usize, 300, 0, 2000, 45, 5000] {
        live.push(heap.alloc(size, AllocFlags::FIXED).unwrap());
        live.push(heap.alloc(size, AllocFlags::MOVEABLE).unwrap());
        let total: usize = heap.arenas().map(|a| a.span).sum();
        assert_eq!(total, heap.region().current_size());
    }
    for block in live.into_iter().step_by(3) {
        heap.free(block).unwrap();
        let total: usize = heap.arenas().map(|a| a.span).sum();
        assert_eq!(total, heap.region().current_size());
    }
    heap.check_integrity().unwrap();
}

#[test]
fn compaction_moves_unlocked_blocks_around_locked_ones() {
    let mut heap = heap(4096);
    let _empty = heap.alloc(0, AllocFlags::MOVEABLE).unwrap();
    let gap = heap.alloc(600, AllocFlags::FIXED).unwrap();
    let pinned = heap.alloc(64, AllocFlags::MOVEABLE).unwrap();
    let loose = heap.alloc(64, AllocFlags::MOVEABLE).unwrap();
    let _fence = heap.alloc(16, AllocFlags::FIXED).unwrap();
    heap.free(gap).unwrap();

    let pinned_addr = heap.lock(pinned).unwrap();
    let loose_addr = heap.resolve(handle(loose)).unwrap();
    heap.compact(usize::MAX / 2).unwrap();

    assert_eq!(heap.resolve(handle(pinned)).unwrap(), pinned_addr);
    assert!(heap.resolve(handle(loose)).unwrap() < pinned_addr);
    assert_ne!(heap.resolve(handle(loose)).unwrap(), loose_addr);
    heap.check_integrity().unwrap();
}

#[test]
fn discarded_block_comes_back_through_realloc() {
    let mut heap = heap(4096);
    let block = heap.alloc(128, AllocFlags::MOVEABLE.with_discardable()).unwrap();
    let h = handle(block);
    heap.realloc(block, 0, ReallocFlags::IN_PLACE).unwrap();

    assert_eq!(heap.size(block).unwrap(), 0);
    assert_eq!(heap.lock(block), Err(HeapError::Discarded(h)));
    assert!(heap.flags(block).unwrap().discardable);

    heap.realloc(block, 64, ReallocFlags::IN_PLACE.with_zero_init()).unwrap();
    assert_eq!(heap.size(block).unwrap(), 64);
    assert!(heap.data(block).unwrap().iter().all(|&b| b == 0));
    heap.check_integrity().unwrap();
}

#[test]
fn discarded_block_comes_back_on_a_full_heap() {
    let mut heap = heap(8192);
    let empty = heap.alloc(0, AllocFlags::MOVEABLE.with_discardable()).unwrap();

    let mut others = Vec::new();
    let moveable = AllocFlags::MOVEABLE.with_discardable().with_no_compact();
    while let Ok(block) = heap.alloc(200, moveable) {
        others.push(block);
    }
    while heap.alloc(0, AllocFlags::FIXED.with_no_compact()).is_ok() {}
    assert!(others.len() >= 2);
    assert_eq!(heap.stats().unwrap().free_arenas, 0);

    heap.realloc(empty, 200, ReallocFlags::IN_PLACE).unwrap();
    assert!(heap.resolve(handle(empty)).is_ok());
    assert_eq!(heap.size(empty).unwrap(), 200);
    for &block in &others {
        let h = handle(block);
        assert_eq!(heap.resolve(h), Err(HeapError::Discarded(h)));
    }
    heap.check_integrity().unwrap();
}

#[test]
fn moveable_alloc_free_leaves_no_trace() {
    let mut heap = heap(8192);
    let before = heap.stats().unwrap();
    let block = heap.alloc(500, AllocFlags::MOVEABLE).unwrap();
    assert_eq!(heap.stats().unwrap().handle_tables, 1);
    heap.free(block).unwrap();
    assert_eq!(heap.stats().unwrap(), before);
}

#[test]
fn corruption_poisons_every_later_call() {
    let mut heap = heap(2048);
    let block = heap.alloc(64, AllocFlags::MOVEABLE).unwrap();
    let addr = heap.resolve(handle(block)).unwrap();
    heap.set_word(addr - 8, 0xdead);
    let result = heap.resolve(handle(block));
    assert!(matches!(result, Err(HeapError::Corrupted { .. })));
    assert_eq!(heap.alloc(8, AllocFlags::FIXED), result.map(Block::Fixed));
    assert_eq!(heap.compact(0), result.map(|_| 0));
}

struct Tracked {
    block: Block,
    seed: u8,
    len: usize,
}

fn fill(heap: &mut LocalHeap, tracked: &Tracked) {
    let data = heap.data_mut(tracked.block).unwrap();
    for (i, byte) in data[..tracked.len].iter_mut().enumerate() {
        *byte = tracked.seed.wrapping_add(i as u8);
    }
}

/// Checks the pattern, forgetting it when the block was discarded.
fn verify(heap: &LocalHeap, tracked: &mut Tracked) {
    match heap.data(tracked.block) {
        Ok(data) => {
            for (i, &byte) in data[..tracked.len].iter().enumerate() {
                assert_eq!(byte, tracked.seed.wrapping_add(i as u8), "block {:?} byte {}", tracked.block, i);
            }
        }
        Err(HeapError::Discarded(_)) => {
            assert!(tracked.len == 0 || heap.flags(tracked.block).unwrap().discardable);
            tracked.len = 0;
        }
        Err(e) => panic!("block {:?}: {}", tracked.block, e),
    }
}

#[test]
fn random_operations_keep_heap_consistent() {
    let mut heap = heap(65536);
    let initial = heap.stats().unwrap();
    let mut rng = SimpleRng::new(0x1337);
    let mut live: Vec<Tracked> = Vec::new();

    for step in 0..3000u32 {
        match rng.next() % 10 {
            0..=3 => {
                let size = rng.next_range(0, 1500) as usize;
                let moveable = rng.next().is_multiple_of(2);
                let mut flags = if moveable { AllocFlags::MOVEABLE } else { AllocFlags::FIXED };
                if moveable && rng.next().is_multiple_of(4) {
                    flags = flags.with_discardable();
                }
                match heap.alloc(size, flags) {
                    Ok(block) => {
                        let tracked = Tracked { block, seed: step as u8, len: size };
                        if size > 0 {
                            fill(&mut heap, &tracked);
                        }
                        live.push(tracked);
                    }
                    Err(HeapError::Exhausted { .. }) => {}
                    Err(e) => panic!("alloc({}) failed: {}", size, e),
                }
            }
            4..=5 if !live.is_empty() => {
                let index = rng.next() as usize % live.len();
                let mut tracked = live.swap_remove(index);
                verify(&heap, &mut tracked);
                heap.free(tracked.block).unwrap();
            }
            6..=7 if !live.is_empty() => {
                let index = rng.next() as usize % live.len();
                let size = rng.next_range(0, 1500) as usize;
                verify(&heap, &mut live[index]);
                let tracked = &mut live[index];
                match heap.realloc(tracked.block, size, ReallocFlags::MOVE) {
                    Ok(Some(block)) => {
                        tracked.block = block;
                        tracked.len = tracked.len.min(size);
                    }
                    Ok(None) => {
                        live.swap_remove(index);
                    }
                    Err(HeapError::Exhausted { .. }) => {}
                    Err(e) => panic!("realloc({:?}, {}) failed: {}", tracked.block, size, e),
                }
            }
            8 if !live.is_empty() => {
                let index = rng.next() as usize % live.len();
                let block = live[index].block;
                if let Ok(addr) = heap.lock(block) {
                    heap.compact(rng.next_range(0, 4096) as usize).unwrap();
                    assert_eq!(heap.handle_of(addr), Ok(block));
                    heap.unlock(block).unwrap();
                }
            }
            _ => {
                heap.check_integrity().unwrap();
                for tracked in live.iter_mut() {
                    verify(&heap, tracked);
                }
            }
        }
    }

    heap.check_integrity().unwrap();
    for mut tracked in live {
        verify(&heap, &mut tracked);
        heap.free(tracked.block).unwrap();
    }
    let stats = heap.stats().unwrap();
    assert_eq!(stats.live_handles, 0);
    assert_eq!(stats.handle_tables, 0);
    assert_eq!(stats.free_arenas, 1);
    assert_eq!(stats.largest_free, initial.largest_free);
    heap.check_integrity().unwrap();
}
