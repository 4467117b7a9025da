use region::RegionProvider;

use crate::arena::ArenaKind;
use crate::error::Result;
use crate::heap::LocalHeap;
use crate::layout::{payload_size, ALIGNMENT, MIN_ARENA_SIZE};

/// Snapshot of how the region is carved up. Free byte counts are payload
/// bytes a fixed allocation could use.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub region_size: usize,
    pub arenas: usize,
    pub fixed_blocks: usize,
    pub moveable_blocks: usize,
    pub free_arenas: usize,
    pub free_bytes: usize,
    pub largest_free: usize,
    pub handle_tables: usize,
    pub live_handles: usize,
}

impl<R: RegionProvider> LocalHeap<R> {
    /// Fails with `Corrupted` when the handle table chain cannot be walked.
    pub fn stats(&self) -> Result<HeapStats> {
        self.ensure_sound()?;
        let tables = self.tables()?;
        let mut stats = HeapStats {
            region_size: self.region.current_size(),
            handle_tables: tables.len(),
            live_handles: self.live_entries()?.len(),
            ..HeapStats::default()
        };
        let header = crate::layout::ARENA_HEADER_SIZE as u32;
        for arena in self.arenas() {
            stats.arenas += 1;
            match arena.kind {
                ArenaKind::Sentinel => {}
                ArenaKind::Free => {
                    let payload = payload_size(arena.span, false);
                    stats.free_arenas += 1;
                    stats.free_bytes += payload;
                    stats.largest_free = stats.largest_free.max(payload);
                }
                ArenaKind::Fixed if tables.contains(&(arena.offset + header)) => {}
                ArenaKind::Fixed => stats.fixed_blocks += 1,
                ArenaKind::Moveable => stats.moveable_blocks += 1,
            }
        }
        Ok(stats)
    }

    /// Walks the arena chain, the free ring and the handle tables and
    /// poisons the heap at the first inconsistency found.
    pub fn check_integrity(&self) -> Result<()> {
        self.ensure_sound()?;
        let size = self.region.current_size();

        let mut arena = self.first;
        let mut total = 0usize;
        let mut free_arenas = 0usize;
        let mut previous_free = false;
        while arena != self.last {
            let next = self.next(arena);
            if next <= arena || next > self.last || next as usize % ALIGNMENT != 0 {
                return Err(self.corrupted(arena));
            }
            if self.prev(next) != arena {
                return Err(self.corrupted(next));
            }
            let span = (next - arena) as usize;
            if span < MIN_ARENA_SIZE {
                return Err(self.corrupted(arena));
            }
            let free = arena != self.first && self.is_free(arena);
            if free {
                if previous_free || self.free_size(arena) != span {
                    return Err(self.corrupted(arena));
                }
                free_arenas += 1;
            }
            previous_free = free;
            total += span;
            arena = next;
        }
        if !self.is_free(self.last) || total + self.span(self.last) != size {
            return Err(self.corrupted(self.last));
        }

        let mut cursor = self.free_next(self.first);
        let mut previous = self.first;
        let mut linked = 0usize;
        while cursor != self.first {
            if (cursor <= previous && previous != self.first)
                || !self.is_free(cursor)
                || self.free_prev(cursor) != previous
                || linked > free_arenas
            {
                return Err(self.corrupted(cursor));
            }
            linked += 1;
            previous = cursor;
            cursor = self.free_next(cursor);
        }
        if linked != free_arenas + 1 || previous != self.last || self.free_prev(self.first) != self.last {
            return Err(self.corrupted(previous));
        }

        for entry in self.live_entries()? {
            self.moveable_arena(entry)?;
        }
        Ok(())
    }
}
