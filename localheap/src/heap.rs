use core::cell::Cell;

use log::{debug, error, trace, warn};
use region::{RegionProvider, VecRegion};

use crate::config::HeapConfig;
use crate::error::{HeapError, Result};
use crate::handle_table::{Handle, FLAG_DISCARDABLE, FLAG_DISCARDED, LOCK_MAX};
use crate::layout::{
    align_up, arena_span, payload_size, ALIGNMENT, ARENA_HEADER_SIZE, MAX_REGION_SIZE,
    MIN_ARENA_SIZE, SENTINEL_OVERHEAD, SIZE, TAG_FIXED, TAG_FREE, TAG_MOVEABLE,
};

/// What callers hold on to: a fixed block's payload offset, or a handle for
/// a moveable one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Block {
    Fixed(u32),
    Moveable(Handle),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocFlags {
    pub moveable: bool,
    pub zero_init: bool,
    pub discardable: bool,
    /// Fail instead of relocating blocks when no free arena fits.
    pub no_compact: bool,
    /// Relocate if needed, but never discard.
    pub no_discard: bool,
}

impl AllocFlags {
    pub const FIXED: AllocFlags = AllocFlags {
        moveable: false,
        zero_init: false,
        discardable: false,
        no_compact: false,
        no_discard: false,
    };

    pub const MOVEABLE: AllocFlags = AllocFlags { moveable: true, ..AllocFlags::FIXED };

    pub const fn with_zero_init(mut self) -> Self {
        self.zero_init = true;
        self
    }

    pub const fn with_discardable(mut self) -> Self {
        self.discardable = true;
        self
    }

    pub const fn with_no_compact(mut self) -> Self {
        self.no_compact = true;
        self
    }

    pub const fn with_no_discard(mut self) -> Self {
        self.no_discard = true;
        self
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReallocFlags {
    /// Lets a fixed block move when it cannot grow in place.
    pub allow_move: bool,
    pub zero_init: bool,
    pub no_compact: bool,
    pub no_discard: bool,
}

impl ReallocFlags {
    pub const IN_PLACE: ReallocFlags = ReallocFlags {
        allow_move: false,
        zero_init: false,
        no_compact: false,
        no_discard: false,
    };

    pub const MOVE: ReallocFlags = ReallocFlags { allow_move: true, ..ReallocFlags::IN_PLACE };

    pub const fn with_zero_init(mut self) -> Self {
        self.zero_init = true;
        self
    }

    fn alloc_flags(&self) -> AllocFlags {
        AllocFlags {
            moveable: false,
            zero_init: self.zero_init,
            discardable: false,
            no_compact: self.no_compact,
            no_discard: self.no_discard,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockFlags {
    pub lock_count: u8,
    pub discardable: bool,
    pub discarded: bool,
}

/// A local heap carved out of one region.
///
/// Every structure lives in the region bytes and is addressed by offsets
/// from the region base, so growing the region never invalidates a handle
/// or a fixed block offset. One heap is driven by one thread at a time.
pub struct LocalHeap<R: RegionProvider = VecRegion> {
    pub(crate) region: R,
    pub(crate) first: u32,
    pub(crate) last: u32,
    pub(crate) htable: u32,
    pub(crate) epoch: u16,
    pub(crate) config: HeapConfig,
    poisoned: Cell<Option<u32>>,
}

impl<R: RegionProvider> LocalHeap<R> {
    pub fn new(region: R) -> Result<Self> {
        Self::with_config(region, HeapConfig::default())
    }

    pub fn with_config(region: R, config: HeapConfig) -> Result<Self> {
        let size = region.current_size();
        if size > MAX_REGION_SIZE {
            return Err(HeapError::RegionTooLarge { size, limit: MAX_REGION_SIZE });
        }
        if size < SENTINEL_OVERHEAD {
            return Err(HeapError::RegionTooSmall { size, required: SENTINEL_OVERHEAD });
        }

        let mut heap = LocalHeap {
            region,
            first: 0,
            last: 0,
            htable: 0,
            epoch: 0,
            config,
            poisoned: Cell::new(None),
        };
        heap.format(size);
        debug!("[localheap] formatted {} byte region, last arena at {:#x}", size, heap.last);
        Ok(heap)
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn set_handle_delta(&mut self, handle_delta: u16) {
        self.config = self.config.with_handle_delta(handle_delta);
    }

    pub fn region(&self) -> &R {
        &self.region
    }

    pub fn into_region(self) -> R {
        self.region
    }

    pub(crate) fn corrupted(&self, offset: u32) -> HeapError {
        if self.poisoned.get().is_none() {
            error!("[localheap] arena chain corrupted near {:#x}, heap poisoned", offset);
            self.poisoned.set(Some(offset));
        }
        HeapError::Corrupted { offset: self.poisoned.get().unwrap_or(offset) }
    }

    pub(crate) fn ensure_sound(&self) -> Result<()> {
        match self.poisoned.get() {
            Some(offset) => Err(HeapError::Corrupted { offset }),
            None => Ok(()),
        }
    }

    pub fn alloc(&mut self, size: usize, flags: AllocFlags) -> Result<Block> {
        self.ensure_sound()?;
        if !flags.moveable {
            let span = arena_span(size, false).ok_or(HeapError::Exhausted { requested: size })?;
            let arena = self.get_block(span, flags, TAG_FIXED)?;
            let addr = arena + ARENA_HEADER_SIZE as u32;
            trace!("[localheap] alloc({}) -> fixed {:#x}", size, addr);
            return Ok(Block::Fixed(addr));
        }

        let handle = self.new_handle_entry()?;
        let entry = handle.entry();
        let discardable = if flags.discardable { FLAG_DISCARDABLE } else { 0 };
        if size == 0 {
            self.set_entry_flags(entry, discardable | FLAG_DISCARDED);
            trace!("[localheap] alloc(0) -> empty handle {}", handle);
            return Ok(Block::Moveable(handle));
        }

        let block = arena_span(size, true)
            .ok_or(HeapError::Exhausted { requested: size })
            .and_then(|span| self.get_block(span, flags, TAG_MOVEABLE));
        match block {
            Ok(arena) => {
                self.bind(entry, arena);
                self.set_entry_flags(entry, discardable);
                trace!("[localheap] alloc({}) -> handle {} at {:#x}", size, handle, self.entry_addr(entry));
                Ok(Block::Moveable(handle))
            }
            Err(e) => {
                self.free_handle_entry(entry)?;
                Err(e)
            }
        }
    }

    pub fn free(&mut self, block: Block) -> Result<()> {
        self.ensure_sound()?;
        match block {
            Block::Fixed(addr) => {
                let arena = self.fixed_arena(addr)?;
                self.release(arena);
                trace!("[localheap] free fixed {:#x}", addr);
            }
            Block::Moveable(handle) => {
                let entry = self.entry_of(handle)?;
                if let Some(arena) = self.moveable_arena(entry)? {
                    if self.entry_lock(entry) > 0 {
                        warn!(
                            "[localheap] freeing {} while locked {} times",
                            handle,
                            self.entry_lock(entry)
                        );
                    }
                    self.release(arena);
                }
                self.free_handle_entry(entry)?;
                trace!("[localheap] free handle {}", handle);
            }
        }
        Ok(())
    }

    /// Resizes a block. Returns `None` when a fixed block was freed by a
    /// resize to zero.
    pub fn realloc(&mut self, block: Block, size: usize, flags: ReallocFlags) -> Result<Option<Block>> {
        self.ensure_sound()?;
        match block {
            Block::Fixed(addr) => self.realloc_fixed(addr, size, flags),
            Block::Moveable(handle) => self.realloc_moveable(handle, size, flags).map(Some),
        }
    }

    fn realloc_fixed(&mut self, addr: u32, size: usize, flags: ReallocFlags) -> Result<Option<Block>> {
        let arena = self.fixed_arena(addr)?;
        if size == 0 {
            self.release(arena);
            trace!("[localheap] realloc fixed {:#x} to 0 -> freed", addr);
            return Ok(None);
        }

        let span = arena_span(size, false).ok_or(HeapError::Exhausted { requested: size })?;
        if self.resize_in_place(arena, span, flags.zero_init) {
            trace!("[localheap] realloc fixed {:#x} to {} in place", addr, size);
            return Ok(Some(Block::Fixed(addr)));
        }
        if !flags.allow_move {
            debug!("[localheap] realloc fixed {:#x} to {} refused, would move", addr, size);
            return Err(HeapError::MoveRefused { requested: size });
        }

        let old_span = self.span(arena);
        let target = self.get_block(span, flags.alloc_flags(), TAG_FIXED)?;
        self.move_payload(arena, target, old_span, span, flags.zero_init);
        self.release(arena);
        let moved = target + ARENA_HEADER_SIZE as u32;
        trace!("[localheap] realloc fixed {:#x} to {} -> moved to {:#x}", addr, size, moved);
        Ok(Some(Block::Fixed(moved)))
    }

    fn realloc_moveable(&mut self, handle: Handle, size: usize, flags: ReallocFlags) -> Result<Block> {
        let entry = self.entry_of(handle)?;
        let lock = self.entry_lock(entry);
        let current = self.moveable_arena(entry)?;

        if size == 0 {
            if lock > 0 {
                return Err(HeapError::Locked(handle));
            }
            if let Some(arena) = current {
                self.discard(entry, arena);
            }
            return Ok(Block::Moveable(handle));
        }

        let span = arena_span(size, true).ok_or(HeapError::Exhausted { requested: size })?;
        let Some(arena) = current else {
            let arena = self.get_block(span, flags.alloc_flags(), TAG_MOVEABLE)?;
            self.bind(entry, arena);
            let flags = self.entry_flags(entry) & !FLAG_DISCARDED;
            self.set_entry_flags(entry, flags);
            trace!("[localheap] realloc {} to {} -> restored at {:#x}", handle, size, self.entry_addr(entry));
            return Ok(Block::Moveable(handle));
        };

        if self.resize_in_place(arena, span, flags.zero_init) {
            trace!("[localheap] realloc {} to {} in place", handle, size);
            return Ok(Block::Moveable(handle));
        }
        if lock > 0 {
            debug!("[localheap] realloc {} to {} refused, block is locked", handle, size);
            return Err(HeapError::MoveRefused { requested: size });
        }

        // Pinned while the new arena is found so compaction leaves it alone.
        self.set_entry_lock(entry, 1);
        let target = self.get_block(span, flags.alloc_flags(), TAG_MOVEABLE);
        self.set_entry_lock(entry, 0);
        let target = target?;

        let old_span = self.span(arena);
        self.move_payload(arena, target, old_span, span, flags.zero_init);
        self.release(arena);
        self.bind(entry, target);
        trace!("[localheap] realloc {} to {} -> moved to {:#x}", handle, size, self.entry_addr(entry));
        Ok(Block::Moveable(handle))
    }

    /// Shrinks in place, or grows into a free successor when it is big
    /// enough. Returns `false` when the block would have to move.
    fn resize_in_place(&mut self, arena: u32, span: usize, zero_init: bool) -> bool {
        let current = self.span(arena);
        if span <= current {
            self.shrink_arena(arena, span);
            return true;
        }

        let next = self.next(arena);
        if next == self.last || !self.is_free(next) || current + self.free_size(next) < span {
            return false;
        }
        self.unlink_block(next);
        self.shrink_arena(arena, span);
        if zero_init {
            let end = arena as usize + self.span(arena);
            self.region.bytes_mut()[arena as usize + current..end].fill(0);
        }
        true
    }

    /// Copies the header-less part of `from` (owner tag included) into
    /// `to`, zeroing whatever the new arena has beyond it.
    fn move_payload(&mut self, from: u32, to: u32, from_span: usize, to_span: usize, zero_init: bool) {
        let header = ARENA_HEADER_SIZE;
        let len = from_span.min(to_span) - header;
        let source = from as usize + header;
        let dest = to as usize + header;
        let bytes = self.region.bytes_mut();
        bytes.copy_within(source..source + len, dest);
        if zero_init {
            let end = to as usize + self.span(to);
            self.region.bytes_mut()[dest + len..end].fill(0);
        }
    }

    pub(crate) fn discard(&mut self, entry: u32, arena: u32) {
        self.release(arena);
        self.set_entry_addr(entry, 0);
        let flags = self.entry_flags(entry) | FLAG_DISCARDED;
        self.set_entry_flags(entry, flags);
        debug!("[localheap] discarded block of entry {:#x} at {:#x}", entry, arena);
    }

    /// Carves an arena of `span` bytes and tags it in use. Falls back to
    /// compaction and then region growth when first fit finds nothing.
    pub(crate) fn get_block(&mut self, span: usize, flags: AllocFlags, tag: u32) -> Result<u32> {
        let arena = match self.find_first_fit(span) {
            Some(arena) => arena,
            None => {
                self.compact_arenas(span, flags.no_compact, flags.no_discard)?;
                match self.find_first_fit(span) {
                    Some(arena) => arena,
                    None if self.grow_region(span) => self
                        .find_first_fit(span)
                        .ok_or(HeapError::Exhausted { requested: span })?,
                    None => {
                        debug!("[localheap] no arena of {} bytes left", span);
                        return Err(HeapError::Exhausted { requested: span });
                    }
                }
            }
        };

        self.remove_free(arena);
        self.set_tag(arena, tag);
        self.shrink_arena(arena, span);
        if flags.zero_init {
            let start = arena as usize + ARENA_HEADER_SIZE;
            let end = arena as usize + self.span(arena);
            self.region.bytes_mut()[start..end].fill(0);
        }
        Ok(arena)
    }

    /// Asks the provider for more bytes and hands them to the free list.
    pub(crate) fn grow_region(&mut self, span: usize) -> bool {
        let old = self.region.current_size();
        let needed = span.saturating_add(MIN_ARENA_SIZE);
        let minimum = old.saturating_add(needed);
        if minimum > MAX_REGION_SIZE {
            warn!("[localheap] region cannot grow past {} bytes", MAX_REGION_SIZE);
            return false;
        }
        let minimum = align_up(minimum, ALIGNMENT);
        // MAX_REGION_SIZE is aligned, so clamping first keeps align_up in range.
        let preferred = align_up(
            old.saturating_add(needed.max(self.config.grow_increment)).min(MAX_REGION_SIZE),
            ALIGNMENT,
        );

        let grown = match self.region.grow(preferred) {
            Ok(()) => preferred,
            Err(_) if preferred > minimum => match self.region.grow(minimum) {
                Ok(()) => minimum,
                Err(e) => {
                    warn!("[localheap] region growth refused: {}", e);
                    return false;
                }
            },
            Err(e) => {
                warn!("[localheap] region growth refused: {}", e);
                return false;
            }
        };

        self.extend_to(grown);
        debug!("[localheap] region grown from {} to {} bytes", old, grown);
        true
    }

    /// Moves the last sentinel to the new end of the region and frees the
    /// bytes in between.
    fn extend_to(&mut self, size: usize) {
        let old_last = self.last;
        let new_last = crate::layout::align_down(size - MIN_ARENA_SIZE, ALIGNMENT) as u32;
        if new_last <= old_last {
            return;
        }

        self.remove_free(old_last);
        self.set_tag(old_last, TAG_FIXED);
        self.set_next(old_last, new_last);

        self.set_word(new_last, old_last | TAG_FREE);
        self.set_next(new_last, new_last);
        self.set_word(new_last + SIZE, 0);
        self.insert_free_before(new_last, self.first);
        self.last = new_last;

        self.release(old_last);
    }

    /// Pins a block and returns its payload offset. Fixed blocks never move,
    /// so their lock count is not tracked.
    pub fn lock(&mut self, block: Block) -> Result<u32> {
        self.ensure_sound()?;
        match block {
            Block::Fixed(addr) => {
                self.fixed_arena(addr)?;
                Ok(addr)
            }
            Block::Moveable(handle) => {
                let entry = self.entry_of(handle)?;
                if self.moveable_arena(entry)?.is_none() {
                    return Err(HeapError::Discarded(handle));
                }
                let lock = self.entry_lock(entry);
                if lock < LOCK_MAX {
                    self.set_entry_lock(entry, lock + 1);
                }
                trace!("[localheap] lock {} -> {}", handle, self.entry_lock(entry));
                Ok(self.entry_addr(entry))
            }
        }
    }

    /// Returns the remaining lock count.
    pub fn unlock(&mut self, block: Block) -> Result<u8> {
        self.ensure_sound()?;
        match block {
            Block::Fixed(addr) => {
                self.fixed_arena(addr)?;
                Ok(0)
            }
            Block::Moveable(handle) => {
                let entry = self.entry_of(handle)?;
                let lock = self.entry_lock(entry);
                if lock == 0 {
                    return Err(HeapError::NotLocked(handle));
                }
                self.set_entry_lock(entry, lock - 1);
                trace!("[localheap] unlock {} -> {}", handle, lock - 1);
                Ok(lock - 1)
            }
        }
    }

    /// Current payload offset of a moveable block.
    pub fn resolve(&self, handle: Handle) -> Result<u32> {
        self.ensure_sound()?;
        let entry = self.entry_of(handle)?;
        match self.moveable_arena(entry)? {
            Some(_) => Ok(self.entry_addr(entry)),
            None => Err(HeapError::Discarded(handle)),
        }
    }

    /// Payload bytes the block can hold; 0 for a discarded block.
    pub fn size(&self, block: Block) -> Result<usize> {
        self.ensure_sound()?;
        match block {
            Block::Fixed(addr) => {
                let arena = self.fixed_arena(addr)?;
                Ok(payload_size(self.span(arena), false))
            }
            Block::Moveable(handle) => {
                let entry = self.entry_of(handle)?;
                Ok(match self.moveable_arena(entry)? {
                    Some(arena) => payload_size(self.span(arena), true),
                    None => 0,
                })
            }
        }
    }

    pub fn flags(&self, block: Block) -> Result<BlockFlags> {
        self.ensure_sound()?;
        match block {
            Block::Fixed(addr) => {
                self.fixed_arena(addr)?;
                Ok(BlockFlags::default())
            }
            Block::Moveable(handle) => {
                let entry = self.entry_of(handle)?;
                let flags = self.entry_flags(entry);
                Ok(BlockFlags {
                    lock_count: self.entry_lock(entry),
                    discardable: flags & FLAG_DISCARDABLE != 0,
                    discarded: flags & FLAG_DISCARDED != 0,
                })
            }
        }
    }

    pub fn set_discardable(&mut self, handle: Handle, discardable: bool) -> Result<()> {
        self.ensure_sound()?;
        let entry = self.entry_of(handle)?;
        let flags = self.entry_flags(entry);
        let flags = if discardable { flags | FLAG_DISCARDABLE } else { flags & !FLAG_DISCARDABLE };
        self.set_entry_flags(entry, flags);
        Ok(())
    }

    /// Finds the block whose payload starts at `addr`.
    pub fn handle_of(&self, addr: u32) -> Result<Block> {
        self.ensure_sound()?;
        let header = ARENA_HEADER_SIZE as u32;
        if addr >= header {
            if let Some(arena) = self.find_arena(addr - header)? {
                if self.tag(arena) == TAG_FIXED && arena != self.first && !self.is_table(addr)? {
                    return Ok(Block::Fixed(addr));
                }
            }
        }
        let overhead = header + crate::layout::MOVEABLE_PREFIX as u32;
        if addr >= overhead {
            if let Some(arena) = self.find_arena(addr - overhead)? {
                if self.tag(arena) == TAG_MOVEABLE {
                    let entry = self.word(arena + header);
                    if !self.is_live_entry(entry)? || self.moveable_arena(entry)? != Some(arena) {
                        return Err(self.corrupted(arena));
                    }
                    return Ok(Block::Moveable(Handle::new(entry, self.entry_generation(entry))));
                }
            }
        }
        Err(HeapError::InvalidAddress(addr))
    }

    pub fn data(&self, block: Block) -> Result<&[u8]> {
        let (start, len) = self.payload(block)?;
        Ok(&self.region.bytes()[start..start + len])
    }

    pub fn data_mut(&mut self, block: Block) -> Result<&mut [u8]> {
        let (start, len) = self.payload(block)?;
        Ok(&mut self.region.bytes_mut()[start..start + len])
    }

    pub(crate) fn payload(&self, block: Block) -> Result<(usize, usize)> {
        self.ensure_sound()?;
        match block {
            Block::Fixed(addr) => {
                let arena = self.fixed_arena(addr)?;
                Ok((addr as usize, payload_size(self.span(arena), false)))
            }
            Block::Moveable(handle) => {
                let entry = self.entry_of(handle)?;
                match self.moveable_arena(entry)? {
                    Some(arena) => Ok((self.entry_addr(entry) as usize, payload_size(self.span(arena), true))),
                    None => Err(HeapError::Discarded(handle)),
                }
            }
        }
    }

    /// Arena of a live fixed block handed out to a caller.
    fn fixed_arena(&self, addr: u32) -> Result<u32> {
        let header = ARENA_HEADER_SIZE as u32;
        if addr < header || addr as usize % ALIGNMENT != 0 {
            warn!("[localheap] {:#x} is not a block address", addr);
            return Err(HeapError::InvalidAddress(addr));
        }
        let Some(arena) = self.find_arena(addr - header)? else {
            warn!("[localheap] no arena behind {:#x}", addr);
            return Err(HeapError::InvalidAddress(addr));
        };
        if arena == self.first || arena == self.last {
            return Err(HeapError::InvalidAddress(addr));
        }
        let is_table = self.is_table(addr)?;
        match self.tag(arena) {
            TAG_FREE => {
                warn!("[localheap] double free of {:#x}", addr);
                Err(HeapError::DoubleFree(addr))
            }
            TAG_FIXED if !is_table => Ok(arena),
            _ => Err(HeapError::InvalidAddress(addr)),
        }
    }
}
