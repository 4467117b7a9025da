use alloc::vec::Vec;
use core::fmt;

use log::{debug, warn};
use region::RegionProvider;

use crate::error::{HeapError, Result};
use crate::heap::{AllocFlags, LocalHeap};
use crate::layout::{
    arena_span, read_u16, write_u16, ALIGNMENT, ARENA_HEADER_SIZE, MIN_ARENA_SIZE, MOVEABLE_PREFIX,
    TAG_FIXED, TAG_MOVEABLE,
};

pub(crate) const ENTRY_SIZE: u32 = 8;
const ENTRY_ADDR: u32 = 0;
const ENTRY_LOCK: u32 = 4;
const ENTRY_FLAGS: u32 = 5;
const ENTRY_GENERATION: u32 = 6;

const TABLE_COUNT: u32 = 0;
const TABLE_ENTRIES: u32 = 8;

pub(crate) const LOCK_FREE: u8 = 0xFF;
pub(crate) const LOCK_MAX: u8 = 0xFE;

pub(crate) const FLAG_DISCARDABLE: u8 = 0x01;
pub(crate) const FLAG_DISCARDED: u8 = 0x40;

/// Stable name of a moveable block: the offset of its handle entry plus the
/// generation the entry had when the handle was issued.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    entry: u32,
    generation: u16,
}

impl Handle {
    pub fn new(entry: u32, generation: u16) -> Self {
        Handle { entry, generation }
    }

    pub fn entry(&self) -> u32 {
        self.entry
    }

    pub fn generation(&self) -> u16 {
        self.generation
    }

    pub fn pack(&self) -> u64 {
        ((self.entry as u64) << 16) | self.generation as u64
    }

    pub fn unpack(packed: u64) -> Self {
        Handle {
            entry: (packed >> 16) as u32,
            generation: (packed & 0xFFFF) as u16,
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{}", self.entry, self.generation)
    }
}

fn table_payload(count: usize) -> usize {
    TABLE_ENTRIES as usize + count * ENTRY_SIZE as usize + 8
}

impl<R: RegionProvider> LocalHeap<R> {
    pub(crate) fn entry_addr(&self, entry: u32) -> u32 {
        self.word(entry + ENTRY_ADDR)
    }

    pub(crate) fn set_entry_addr(&mut self, entry: u32, addr: u32) {
        self.set_word(entry + ENTRY_ADDR, addr);
    }

    pub(crate) fn entry_lock(&self, entry: u32) -> u8 {
        self.region.bytes()[(entry + ENTRY_LOCK) as usize]
    }

    pub(crate) fn set_entry_lock(&mut self, entry: u32, lock: u8) {
        self.region.bytes_mut()[(entry + ENTRY_LOCK) as usize] = lock;
    }

    pub(crate) fn entry_flags(&self, entry: u32) -> u8 {
        self.region.bytes()[(entry + ENTRY_FLAGS) as usize]
    }

    pub(crate) fn set_entry_flags(&mut self, entry: u32, flags: u8) {
        self.region.bytes_mut()[(entry + ENTRY_FLAGS) as usize] = flags;
    }

    pub(crate) fn entry_generation(&self, entry: u32) -> u16 {
        read_u16(self.region.bytes(), entry + ENTRY_GENERATION)
    }

    fn set_entry_generation(&mut self, entry: u32, generation: u16) {
        write_u16(self.region.bytes_mut(), entry + ENTRY_GENERATION, generation);
    }

    fn table_count(&self, table: u32) -> u32 {
        self.word(table + TABLE_COUNT)
    }

    fn table_entry(table: u32, index: u32) -> u32 {
        table + TABLE_ENTRIES + index * ENTRY_SIZE
    }

    fn table_link(&self, table: u32) -> u32 {
        Self::table_entry(table, self.table_count(table))
    }

    /// Payload offsets of every handle table, newest first.
    pub(crate) fn tables(&self) -> Result<Vec<u32>> {
        let size = self.region.current_size();
        let mut tables = Vec::new();
        let mut table = self.htable;
        while table != 0 {
            if table as usize % ALIGNMENT != 0 || table as usize + table_payload(0) > size {
                return Err(self.corrupted(table));
            }
            let count = self.table_count(table) as usize;
            if table as usize + table_payload(count) > size || tables.len() > self.max_arenas() {
                return Err(self.corrupted(table));
            }
            tables.push(table);
            table = self.word(self.table_link(table));
        }
        Ok(tables)
    }

    /// Every entry currently backing a handle, in table order.
    pub(crate) fn live_entries(&self) -> Result<Vec<u32>> {
        let mut entries = Vec::new();
        for table in self.tables()? {
            for index in 0..self.table_count(table) {
                let entry = Self::table_entry(table, index);
                if self.entry_lock(entry) != LOCK_FREE {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    pub(crate) fn is_table(&self, data: u32) -> Result<bool> {
        Ok(self.tables()?.contains(&data))
    }

    pub(crate) fn new_handle_entry(&mut self) -> Result<Handle> {
        let mut slot = None;
        'tables: for table in self.tables()? {
            for index in 0..self.table_count(table) {
                let entry = Self::table_entry(table, index);
                if self.entry_lock(entry) == LOCK_FREE {
                    slot = Some(entry);
                    break 'tables;
                }
            }
        }
        let entry = match slot {
            Some(entry) => entry,
            None => Self::table_entry(self.new_table()?, 0),
        };

        self.set_entry_addr(entry, 0);
        self.set_entry_lock(entry, 0);
        self.set_entry_flags(entry, 0);
        Ok(Handle::new(entry, self.entry_generation(entry)))
    }

    fn new_table(&mut self) -> Result<u32> {
        let count = self.config.handle_delta.max(1) as u32;
        let payload = table_payload(count as usize);
        let span = arena_span(payload, false).ok_or(HeapError::Exhausted { requested: payload })?;
        let arena = self.get_block(span, AllocFlags::FIXED, TAG_FIXED)?;
        let table = arena + ARENA_HEADER_SIZE as u32;

        let generation = self.epoch;
        self.epoch = self.epoch.wrapping_add(1);

        self.set_word(table + TABLE_COUNT, count);
        self.set_word(table + TABLE_COUNT + 4, 0);
        for index in 0..count {
            let entry = Self::table_entry(table, index);
            self.set_entry_addr(entry, 0);
            self.set_entry_lock(entry, LOCK_FREE);
            self.set_entry_flags(entry, 0);
            self.set_entry_generation(entry, generation);
        }
        let link = Self::table_entry(table, count);
        self.set_word(link, self.htable);
        self.set_word(link + 4, 0);
        self.htable = table;

        debug!("[localheap] new handle table at {:#x} with {} entries", table, count);
        Ok(table)
    }

    /// Returns the slot to its table and gives the table's block back once
    /// every slot in it is unused.
    pub(crate) fn free_handle_entry(&mut self, entry: u32) -> Result<()> {
        let generation = self.entry_generation(entry).wrapping_add(1);
        self.set_entry_addr(entry, 0);
        self.set_entry_flags(entry, 0);
        self.set_entry_lock(entry, LOCK_FREE);
        self.set_entry_generation(entry, generation);

        let tables = self.tables()?;
        let Some(position) = tables.iter().position(|&table| {
            entry >= Self::table_entry(table, 0) && entry < Self::table_link(self, table)
        }) else {
            return Ok(());
        };
        let table = tables[position];
        let idle = (0..self.table_count(table))
            .all(|index| self.entry_lock(Self::table_entry(table, index)) == LOCK_FREE);
        if !idle {
            return Ok(());
        }

        let successor = self.word(self.table_link(table));
        if position == 0 {
            self.htable = successor;
        } else {
            let predecessor = tables[position - 1];
            let link = self.table_link(predecessor);
            self.set_word(link, successor);
        }
        self.release(table - ARENA_HEADER_SIZE as u32);
        debug!("[localheap] reclaimed idle handle table at {:#x}", table);
        Ok(())
    }

    /// Whether `entry` names an in-use slot inside one of the tables.
    pub(crate) fn is_live_entry(&self, entry: u32) -> Result<bool> {
        for table in self.tables()? {
            let start = Self::table_entry(table, 0);
            if entry >= start && entry < self.table_link(table) {
                return Ok((entry - start) % ENTRY_SIZE == 0 && self.entry_lock(entry) != LOCK_FREE);
            }
        }
        Ok(false)
    }

    /// Entry behind a handle, provided the slot is in use and still carries
    /// the handle's generation.
    pub(crate) fn entry_of(&self, handle: Handle) -> Result<u32> {
        for table in self.tables()? {
            let start = Self::table_entry(table, 0);
            let end = self.table_link(table);
            if handle.entry < start || handle.entry >= end {
                continue;
            }
            let entry = handle.entry;
            if (entry - start) % ENTRY_SIZE == 0
                && self.entry_lock(entry) != LOCK_FREE
                && self.entry_generation(entry) == handle.generation
            {
                return Ok(entry);
            }
            break;
        }
        warn!("[localheap] invalid handle {}", handle);
        Err(HeapError::InvalidHandle(handle))
    }

    /// Arena holding the entry's block, or `None` when the block was
    /// discarded or never materialised.
    pub(crate) fn moveable_arena(&self, entry: u32) -> Result<Option<u32>> {
        let addr = self.entry_addr(entry);
        if addr == 0 {
            return Ok(None);
        }
        let overhead = (ARENA_HEADER_SIZE + MOVEABLE_PREFIX) as u32;
        if addr < overhead || addr as usize % ALIGNMENT != 0 || addr - overhead >= self.last {
            return Err(self.corrupted(entry));
        }
        let arena = addr - overhead;
        if arena as usize + MIN_ARENA_SIZE > self.last as usize
            || self.tag(arena) != TAG_MOVEABLE
            || self.word(arena + ARENA_HEADER_SIZE as u32) != entry
        {
            return Err(self.corrupted(arena));
        }
        Ok(Some(arena))
    }

    /// Writes the owner tag and points the entry at the payload.
    pub(crate) fn bind(&mut self, entry: u32, arena: u32) {
        let tag = arena + ARENA_HEADER_SIZE as u32;
        self.set_word(tag, entry);
        self.set_word(tag + 4, 0);
        self.set_entry_addr(entry, tag + MOVEABLE_PREFIX as u32);
    }
}
