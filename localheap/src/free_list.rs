use region::RegionProvider;

use crate::heap::LocalHeap;
use crate::layout::{FREE_NEXT, FREE_PREV, MIN_ARENA_SIZE, SIZE, TAG_FREE};

impl<R: RegionProvider> LocalHeap<R> {
    pub(crate) fn free_prev(&self, arena: u32) -> u32 {
        self.word(arena + FREE_PREV)
    }

    pub(crate) fn free_next(&self, arena: u32) -> u32 {
        self.word(arena + FREE_NEXT)
    }

    pub(crate) fn free_size(&self, arena: u32) -> usize {
        self.word(arena + SIZE) as usize
    }

    pub(crate) fn set_free_links(&mut self, arena: u32, prev: u32, next: u32) {
        self.set_word(arena + FREE_PREV, prev);
        self.set_word(arena + FREE_NEXT, next);
    }

    pub(crate) fn insert_free_before(&mut self, arena: u32, before: u32) {
        let prev = self.free_prev(before);
        self.set_free_links(arena, prev, before);
        self.set_word(prev + FREE_NEXT, arena);
        self.set_word(before + FREE_PREV, arena);
    }

    pub(crate) fn remove_free(&mut self, arena: u32) {
        let prev = self.free_prev(arena);
        let next = self.free_next(arena);
        self.set_word(prev + FREE_NEXT, next);
        self.set_word(next + FREE_PREV, prev);
    }

    /// Flags an in-use arena free and links it in front of the next free
    /// arena in address order. The last sentinel is always free, so the
    /// forward walk ends.
    pub(crate) fn mark_free(&mut self, arena: u32) {
        self.set_tag(arena, TAG_FREE);
        let next = self.next(arena);
        self.set_word(arena + SIZE, next - arena);

        let mut cursor = next;
        while !self.is_free(cursor) {
            cursor = self.next(cursor);
        }
        self.insert_free_before(arena, cursor);
    }

    /// Frees an in-use arena and merges it with free neighbours. Returns the
    /// arena that now covers the released bytes.
    pub(crate) fn release(&mut self, arena: u32) -> u32 {
        let prev = self.prev(arena);
        let arena = if self.is_free(prev) {
            self.unlink_block(arena);
            prev
        } else {
            self.mark_free(arena);
            arena
        };

        let next = self.next(arena);
        if next != self.last && self.is_free(next) {
            self.unlink_block(next);
        }
        arena
    }

    /// Trims an in-use arena to `span` bytes, returning the tail to the free
    /// list when it can hold a free arena of its own.
    pub(crate) fn shrink_arena(&mut self, arena: u32, span: usize) {
        if self.span(arena) >= span + MIN_ARENA_SIZE {
            let tail = arena + span as u32;
            self.link_block(arena, tail);
            self.release(tail);
        }
    }

    /// First free arena in list order spanning at least `min_span` bytes.
    pub(crate) fn find_first_fit(&self, min_span: usize) -> Option<u32> {
        let mut cursor = self.free_next(self.first);
        for _ in 0..=self.max_arenas() {
            if cursor == self.first {
                return None;
            }
            if cursor != self.last && self.free_size(cursor) >= min_span {
                return Some(cursor);
            }
            cursor = self.free_next(cursor);
        }
        None
    }

    pub(crate) fn largest_free(&self) -> usize {
        let mut largest = 0;
        let mut cursor = self.free_next(self.first);
        for _ in 0..=self.max_arenas() {
            if cursor == self.first {
                break;
            }
            if cursor != self.last {
                largest = largest.max(self.free_size(cursor));
            }
            cursor = self.free_next(cursor);
        }
        largest
    }

    pub(crate) fn max_arenas(&self) -> usize {
        self.region.current_size() / MIN_ARENA_SIZE
    }
}
