use log::{debug, trace};
use region::RegionProvider;

use crate::error::Result;
use crate::handle_table::{FLAG_DISCARDABLE, FLAG_DISCARDED};
use crate::heap::LocalHeap;
use crate::layout::{payload_size, ARENA_HEADER_SIZE, MOVEABLE_PREFIX, TAG_MOVEABLE};

impl<R: RegionProvider> LocalHeap<R> {
    /// Defragments until a free arena of `min_free` payload bytes exists or
    /// nothing more can be done. Returns the largest free payload.
    pub fn compact(&mut self, min_free: usize) -> Result<usize> {
        self.ensure_sound()?;
        let largest = self.compact_arenas(min_free.saturating_add(ARENA_HEADER_SIZE), false, false)?;
        Ok(payload_size(largest, false))
    }

    /// Relocates unlocked moveable blocks, then discards unlocked
    /// discardable ones and relocates again. Stops as soon as a free arena
    /// of `min_span` bytes exists. Returns the largest free span.
    pub(crate) fn compact_arenas(&mut self, min_span: usize, no_compact: bool, no_discard: bool) -> Result<usize> {
        let largest = self.largest_free();
        if largest >= min_span || no_compact {
            return Ok(largest);
        }

        let moved = self.relocate_unlocked()?;
        let largest = self.largest_free();
        debug!("[localheap] compaction moved {} blocks, largest free {} of {} wanted", moved, largest, min_span);
        if largest >= min_span || no_discard {
            return Ok(largest);
        }

        let discarded = self.discard_unlocked()?;
        if discarded > 0 {
            self.relocate_unlocked()?;
        }
        let largest = self.largest_free();
        debug!("[localheap] compaction discarded {} blocks, largest free {}", discarded, largest);
        Ok(largest)
    }

    /// Moves every unlocked moveable block into the smallest hole below it
    /// that fits, or slides it over a free predecessor.
    fn relocate_unlocked(&mut self) -> Result<usize> {
        let mut moved = 0;
        for entry in self.live_entries()? {
            if self.entry_lock(entry) != 0 || self.entry_flags(entry) & FLAG_DISCARDED != 0 {
                continue;
            }
            let Some(arena) = self.moveable_arena(entry)? else {
                continue;
            };
            let span = self.span(arena);
            if let Some(hole) = self.smallest_hole_below(arena, span) {
                self.move_into_hole(entry, arena, hole, span);
                moved += 1;
            } else if self.is_free(self.prev(arena)) {
                self.slide_down(entry, arena, span);
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// The free list is in address order, so the scan stops at `arena`.
    fn smallest_hole_below(&self, arena: u32, span: usize) -> Option<u32> {
        let mut best: Option<u32> = None;
        let mut cursor = self.free_next(self.first);
        while cursor != self.first && cursor < arena {
            let size = self.free_size(cursor);
            if size >= span && best.is_none_or(|b| size < self.free_size(b)) {
                best = Some(cursor);
            }
            cursor = self.free_next(cursor);
        }
        best
    }

    fn move_into_hole(&mut self, entry: u32, arena: u32, hole: u32, span: usize) {
        self.remove_free(hole);
        self.set_tag(hole, TAG_MOVEABLE);
        self.shrink_arena(hole, span);
        self.copy_arena_body(arena, hole, span);
        self.release(arena);
        self.set_entry_addr(entry, hole + (ARENA_HEADER_SIZE + MOVEABLE_PREFIX) as u32);
        trace!("[localheap] moved entry {:#x} from {:#x} into hole {:#x}", entry, arena, hole);
    }

    /// The predecessor is too small to hold the block, so the block is
    /// shifted down onto it and the freed bytes end up behind it.
    fn slide_down(&mut self, entry: u32, arena: u32, span: usize) {
        let dest = self.prev(arena);
        self.remove_free(dest);
        self.set_tag(dest, TAG_MOVEABLE);
        self.unlink_block(arena);
        self.copy_arena_body(arena, dest, span);
        self.shrink_arena(dest, span);
        self.set_entry_addr(entry, dest + (ARENA_HEADER_SIZE + MOVEABLE_PREFIX) as u32);
        trace!("[localheap] slid entry {:#x} from {:#x} down to {:#x}", entry, arena, dest);
    }

    fn copy_arena_body(&mut self, from: u32, to: u32, span: usize) {
        let source = from as usize + ARENA_HEADER_SIZE;
        let dest = to as usize + ARENA_HEADER_SIZE;
        let len = span - ARENA_HEADER_SIZE;
        self.region.bytes_mut().copy_within(source..source + len, dest);
    }

    fn discard_unlocked(&mut self) -> Result<usize> {
        let mut discarded = 0;
        for entry in self.live_entries()? {
            if self.entry_lock(entry) != 0 || self.entry_flags(entry) & FLAG_DISCARDABLE == 0 {
                continue;
            }
            if let Some(arena) = self.moveable_arena(entry)? {
                self.discard(entry, arena);
                discarded += 1;
            }
        }
        Ok(discarded)
    }
}
