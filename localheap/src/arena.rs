use region::RegionProvider;

use crate::error::Result;
use crate::heap::LocalHeap;
use crate::layout::{
    read_u32, write_u32, ALIGNMENT, MIN_ARENA_SIZE, NEXT, PREV, SIZE, TAG_FIXED, TAG_FREE, TAG_MASK,
    TAG_MOVEABLE,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArenaKind {
    Sentinel,
    Free,
    Fixed,
    Moveable,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ArenaInfo {
    pub offset: u32,
    pub span: usize,
    pub kind: ArenaKind,
}

/// Address-ordered walk over every arena, first sentinel to last.
pub struct ArenaIter<'a> {
    bytes: &'a [u8],
    current: Option<u32>,
    first: u32,
    last: u32,
}

impl Iterator for ArenaIter<'_> {
    type Item = ArenaInfo;

    fn next(&mut self) -> Option<ArenaInfo> {
        let arena = self.current?;
        let tag = read_u32(self.bytes, arena + PREV) & TAG_MASK;
        let kind = if arena == self.first || arena == self.last {
            ArenaKind::Sentinel
        } else {
            match tag {
                TAG_FREE => ArenaKind::Free,
                TAG_MOVEABLE => ArenaKind::Moveable,
                _ => ArenaKind::Fixed,
            }
        };
        if arena == self.last {
            self.current = None;
            return Some(ArenaInfo { offset: arena, span: self.bytes.len() - arena as usize, kind });
        }
        let next = read_u32(self.bytes, arena + NEXT);
        self.current = if next > arena && next <= self.last { Some(next) } else { None };
        Some(ArenaInfo { offset: arena, span: next.saturating_sub(arena) as usize, kind })
    }
}

impl<R: RegionProvider> LocalHeap<R> {
    pub(crate) fn word(&self, offset: u32) -> u32 {
        read_u32(self.region.bytes(), offset)
    }

    pub(crate) fn set_word(&mut self, offset: u32, value: u32) {
        write_u32(self.region.bytes_mut(), offset, value);
    }

    pub(crate) fn prev(&self, arena: u32) -> u32 {
        self.word(arena + PREV) & !TAG_MASK
    }

    pub(crate) fn next(&self, arena: u32) -> u32 {
        self.word(arena + NEXT)
    }

    pub(crate) fn tag(&self, arena: u32) -> u32 {
        self.word(arena + PREV) & TAG_MASK
    }

    pub(crate) fn is_free(&self, arena: u32) -> bool {
        self.tag(arena) == TAG_FREE
    }

    pub(crate) fn set_tag(&mut self, arena: u32, tag: u32) {
        let prev = self.prev(arena);
        self.set_word(arena + PREV, prev | tag);
    }

    pub(crate) fn set_prev(&mut self, arena: u32, prev: u32) {
        let tag = self.tag(arena);
        self.set_word(arena + PREV, prev | tag);
    }

    pub(crate) fn set_next(&mut self, arena: u32, next: u32) {
        self.set_word(arena + NEXT, next);
    }

    /// Bytes from this arena's header to the next arena's header.
    pub(crate) fn span(&self, arena: u32) -> usize {
        if arena == self.last {
            self.region.current_size() - arena as usize
        } else {
            (self.next(arena) - arena) as usize
        }
    }

    /// Writes both sentinels over `size` bytes and frees everything between
    /// them.
    pub(crate) fn format(&mut self, size: usize) {
        let first = 0u32;
        let last = crate::layout::align_down(size - MIN_ARENA_SIZE, ALIGNMENT) as u32;

        self.set_word(first + PREV, first | TAG_FIXED);
        self.set_word(first + NEXT, last);
        self.set_word(first + SIZE, 0);
        self.set_free_links(first, last, last);

        self.set_word(last + PREV, first | TAG_FREE);
        self.set_word(last + NEXT, last);
        self.set_word(last + SIZE, 0);
        self.set_free_links(last, first, first);

        self.first = first;
        self.last = last;

        let body = first + MIN_ARENA_SIZE as u32;
        if last as usize >= body as usize + MIN_ARENA_SIZE {
            self.link_block(first, body);
            self.release(body);
        }
    }

    /// Splices `arena` into the address chain right after `after` as an
    /// in-use fixed arena.
    pub(crate) fn link_block(&mut self, after: u32, arena: u32) {
        let next = self.next(after);
        self.set_word(arena + PREV, after | TAG_FIXED);
        self.set_next(arena, next);
        self.set_prev(next, arena);
        self.set_next(after, arena);
    }

    /// Removes `arena` from the address chain; a free predecessor absorbs
    /// its bytes.
    pub(crate) fn unlink_block(&mut self, arena: u32) {
        if self.is_free(arena) {
            self.remove_free(arena);
        }
        let prev = self.prev(arena);
        let next = self.next(arena);
        self.set_next(prev, next);
        self.set_prev(next, prev);
        if self.is_free(prev) {
            self.set_word(prev + SIZE, next - prev);
        }
    }

    /// Looks for an arena header at exactly `target`, checking the chain on
    /// the way.
    pub(crate) fn find_arena(&self, target: u32) -> Result<Option<u32>> {
        let mut arena = self.first;
        loop {
            if arena == target {
                return Ok(Some(arena));
            }
            if arena == self.last || arena > target {
                return Ok(None);
            }
            let next = self.next(arena);
            if next <= arena || next > self.last || next as usize % ALIGNMENT != 0 {
                return Err(self.corrupted(arena));
            }
            if self.prev(next) != arena {
                return Err(self.corrupted(next));
            }
            arena = next;
        }
    }

    pub fn arenas(&self) -> ArenaIter<'_> {
        ArenaIter {
            bytes: self.region.bytes(),
            current: Some(self.first),
            first: self.first,
            last: self.last,
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::test_support::heap;

    #[test]
    fn fresh_heap_has_sentinels_around_one_free_arena() {
        let heap = heap(1024);
        let arenas: Vec<ArenaInfo> = heap.arenas().collect();
        assert_eq!(arenas.len(), 3);
        assert_eq!(arenas[0], ArenaInfo { offset: 0, span: 24, kind: ArenaKind::Sentinel });
        assert_eq!(arenas[1], ArenaInfo { offset: 24, span: 1024 - 48, kind: ArenaKind::Free });
        assert_eq!(arenas[2], ArenaInfo { offset: 1000, span: 24, kind: ArenaKind::Sentinel });
    }

    #[test]
    fn minimal_heap_has_only_sentinels() {
        let heap = heap(48);
        let kinds: Vec<ArenaKind> = heap.arenas().map(|a| a.kind).collect();
        assert_eq!(kinds, [ArenaKind::Sentinel, ArenaKind::Sentinel]);
    }

    #[test]
    fn unaligned_region_tail_belongs_to_last_sentinel() {
        let heap = heap(1029);
        let last = heap.arenas().last().unwrap();
        assert_eq!(last.offset, 1000);
        assert_eq!(last.span, 29);
    }

    #[test]
    fn link_block_splices_in_address_order() {
        let mut heap = heap(1024);
        heap.remove_free(24);
        heap.set_tag(24, TAG_FIXED);
        heap.link_block(24, 200);
        assert_eq!(heap.next(24), 200);
        assert_eq!(heap.prev(200), 24);
        assert_eq!(heap.next(200), heap.last);
        assert_eq!(heap.prev(heap.last), 200);
        assert_eq!(heap.tag(200), TAG_FIXED);
    }

    #[test]
    fn unlink_block_after_free_arena_grows_it() {
        let mut heap = heap(1024);
        heap.remove_free(24);
        heap.set_tag(24, TAG_FIXED);
        heap.link_block(24, 200);
        heap.link_block(200, 400);
        heap.release(24);
        assert!(heap.is_free(24));
        assert_eq!(heap.word(24 + SIZE), 176);

        heap.unlink_block(200);
        assert_eq!(heap.next(24), 400);
        assert_eq!(heap.prev(400), 24);
        assert_eq!(heap.word(24 + SIZE), 376);
    }

    #[test]
    fn find_arena_only_matches_headers() {
        let heap = heap(1024);
        assert_eq!(heap.find_arena(24), Ok(Some(24)));
        assert_eq!(heap.find_arena(32), Ok(None));
        assert_eq!(heap.find_arena(heap.last), Ok(Some(heap.last)));
        assert_eq!(heap.find_arena(5000), Ok(None));
    }

    #[test]
    fn find_arena_reports_broken_back_link() {
        let mut heap = heap(1024);
        heap.set_word(heap.last + PREV, 8 | TAG_FREE);
        assert!(matches!(
            heap.find_arena(heap.last),
            Err(crate::HeapError::Corrupted { .. })
        ));
    }
}
