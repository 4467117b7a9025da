pub const DEFAULT_HANDLE_DELTA: u16 = 0x20;
pub const DEFAULT_GROW_INCREMENT: usize = 0x8000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    /// Entries in each newly created handle table.
    pub handle_delta: u16,
    /// Bytes requested from the region provider when the heap runs dry.
    pub grow_increment: usize,
}

impl HeapConfig {
    pub const fn new() -> Self {
        HeapConfig {
            handle_delta: DEFAULT_HANDLE_DELTA,
            grow_increment: DEFAULT_GROW_INCREMENT,
        }
    }

    pub const fn with_handle_delta(mut self, handle_delta: u16) -> Self {
        self.handle_delta = if handle_delta == 0 { 1 } else { handle_delta };
        self
    }

    pub const fn with_grow_increment(mut self, grow_increment: usize) -> Self {
        self.grow_increment = grow_increment;
        self
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}
