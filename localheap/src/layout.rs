pub const ALIGNMENT: usize = 8;

pub const ARENA_HEADER_SIZE: usize = 8;
pub const FREE_HEADER_SIZE: usize = 20;
pub const MIN_ARENA_SIZE: usize = align_up(FREE_HEADER_SIZE, ALIGNMENT);
pub const MOVEABLE_PREFIX: usize = 8;

/// First and last sentinel arenas together.
pub const SENTINEL_OVERHEAD: usize = 2 * MIN_ARENA_SIZE;
pub const MAX_REGION_SIZE: usize = align_down(u32::MAX as usize, ALIGNMENT);

// Arena header field offsets.
pub(crate) const PREV: u32 = 0;
pub(crate) const NEXT: u32 = 4;
pub(crate) const SIZE: u32 = 8;
pub(crate) const FREE_PREV: u32 = 12;
pub(crate) const FREE_NEXT: u32 = 16;

pub(crate) const TAG_MASK: u32 = 0b11;
pub(crate) const TAG_FREE: u32 = 0b00;
pub(crate) const TAG_FIXED: u32 = 0b01;
pub(crate) const TAG_MOVEABLE: u32 = 0b11;

pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

/// Bytes an arena must span to hand out `size` payload bytes, or `None`
/// when the request cannot be addressed inside any region.
pub fn arena_span(size: usize, moveable: bool) -> Option<usize> {
    let prefix = if moveable { MOVEABLE_PREFIX } else { 0 };
    let raw = size.checked_add(ARENA_HEADER_SIZE + prefix)?;
    if raw > MAX_REGION_SIZE {
        return None;
    }
    Some(align_up(raw.max(MIN_ARENA_SIZE), ALIGNMENT))
}

/// Payload bytes an in-use arena of `span` bytes offers.
pub fn payload_size(span: usize, moveable: bool) -> usize {
    let prefix = if moveable { MOVEABLE_PREFIX } else { 0 };
    span.saturating_sub(ARENA_HEADER_SIZE + prefix)
}

pub(crate) fn read_u32(bytes: &[u8], offset: u32) -> u32 {
    let start = offset as usize;
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[start..start + 4]);
    u32::from_le_bytes(word)
}

pub(crate) fn write_u32(bytes: &mut [u8], offset: u32, value: u32) {
    let start = offset as usize;
    bytes[start..start + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn read_u16(bytes: &[u8], offset: u32) -> u16 {
    let start = offset as usize;
    u16::from_le_bytes([bytes[start], bytes[start + 1]])
}

pub(crate) fn write_u16(bytes: &mut [u8], offset: u32, value: u16) {
    let start = offset as usize;
    bytes[start..start + 2].copy_from_slice(&value.to_le_bytes());
}
