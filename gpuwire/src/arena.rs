//! Block-chained command arena.
//!
//! [`CommandAllocator`] appends tagged, variable-length records into a chain
//! of byte blocks. Each record is a 4-byte tag followed by its aligned
//! payload. The last live tag of every block is [`END_OF_BLOCK`], so a
//! [`CommandIterator`] can walk the chain without knowing record sizes up
//! front: the reader asks for each payload with the size and alignment it
//! expects for that tag.
//!
//! Blocks are moved, never copied, from the allocator to the iterator.

use tracing::trace;

/// Tag marking the end of the live region of a block.
pub const END_OF_BLOCK: u32 = u32::MAX;

/// Tag of a record that continues the previous one.
pub const ADDITIONAL_DATA: u32 = u32::MAX - 1;

/// Size of a tag slot.
const TAG_SIZE: usize = 4;

/// Rounds `offset` up to a multiple of `align`.
const fn align_up(offset: usize, align: usize) -> Option<usize> {
    match offset.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Allocates a zeroed block, failing instead of aborting.
fn new_block(size: usize) -> Option<Vec<u8>> {
    let mut block = Vec::new();
    block.try_reserve_exact(size).ok()?;
    block.resize(size, 0);
    Some(block)
}

/// A position the allocator can be rolled back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// Number of blocks at the checkpoint.
    blocks: usize,
    /// Write offset in the last block.
    offset: usize,
}

/// Blocks moved out of a [`CommandAllocator`], ready for iteration.
#[derive(Debug, Default)]
pub struct CommandBlocks {
    /// Terminated blocks, in write order.
    blocks: Vec<Vec<u8>>,
}

impl CommandBlocks {
    /// Returns `true` if no record was ever written.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Capacity of each block.
    pub fn block_sizes(&self) -> Vec<usize> {
        self.blocks.iter().map(Vec::len).collect()
    }
}

/// Append-only writer of tagged records.
#[derive(Debug)]
pub struct CommandAllocator {
    /// Blocks written so far; the last one is current.
    blocks: Vec<Vec<u8>>,
    /// Write offset in the current block.
    offset: usize,
    /// Size of the first block.
    initial_block_size: usize,
    /// Cap on the doubling growth.
    max_block_size: usize,
    /// Cap on the total bytes of all blocks.
    memory_limit: Option<usize>,
    /// Total bytes of all blocks.
    allocated: usize,
}

impl CommandAllocator {
    /// Default size of the first block.
    pub const DEFAULT_INITIAL_BLOCK_SIZE: usize = 2 * 1024;
    /// Default cap on the doubling growth.
    pub const DEFAULT_MAX_BLOCK_SIZE: usize = 16 * 1024;

    /// Creates an allocator with default block sizes.
    pub const fn new() -> Self {
        Self::with_block_sizes(Self::DEFAULT_INITIAL_BLOCK_SIZE, Self::DEFAULT_MAX_BLOCK_SIZE)
    }

    /// Creates an allocator with explicit block sizes.
    pub const fn with_block_sizes(initial_block_size: usize, max_block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            offset: 0,
            initial_block_size,
            max_block_size,
            memory_limit: None,
            allocated: 0,
        }
    }

    /// Caps the total bytes of all blocks. Allocations past the cap fail.
    #[must_use]
    pub const fn memory_limit(mut self, limit: Option<usize>) -> Self {
        self.memory_limit = limit;
        self
    }

    /// Total bytes of all blocks.
    pub const fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    /// Number of blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Returns `true` if nothing has been written since the last reset.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Appends a record tagged `tag` with `size` bytes aligned to `align`.
    ///
    /// Returns `None` on allocation failure; the allocator is then unchanged.
    /// `align` must be a power of two and `tag` must not be a reserved tag.
    pub fn allocate(&mut self, tag: u32, size: usize, align: usize) -> Option<&mut [u8]> {
        debug_assert!(tag != END_OF_BLOCK && tag != ADDITIONAL_DATA);
        self.allocate_tagged(tag, size, align)
    }

    /// Appends a continuation of the previous record.
    pub fn allocate_data(&mut self, size: usize, align: usize) -> Option<&mut [u8]> {
        self.allocate_tagged(ADDITIONAL_DATA, size, align)
    }

    /// Bytes from `offset` needed for a tag, its payload and a trailing sentinel.
    /// Returns the tag position, payload position and end of the record.
    fn layout(offset: usize, size: usize, align: usize) -> Option<(usize, usize, usize)> {
        let tag_at = align_up(offset, TAG_SIZE)?;
        let data_at = align_up(tag_at.checked_add(TAG_SIZE)?, align)?;
        let end = data_at.checked_add(size)?;
        let sentinel_end = align_up(end, TAG_SIZE)?.checked_add(TAG_SIZE)?;
        Some((tag_at, data_at, sentinel_end))
    }

    /// Shared body of [`allocate`](Self::allocate) and [`allocate_data`](Self::allocate_data).
    fn allocate_tagged(&mut self, tag: u32, size: usize, align: usize) -> Option<&mut [u8]> {
        debug_assert!(align.is_power_of_two());
        if self.blocks.is_empty() {
            self.push_block(self.initial_block_size)?;
        }
        let capacity = self.blocks.last().map_or(0, Vec::len);
        let (mut tag_at, mut data_at, mut sentinel_end) = Self::layout(self.offset, size, align)?;
        if sentinel_end > capacity {
            let (_, _, needed) = Self::layout(0, size, align)?;
            let grown = capacity
                .saturating_mul(2)
                .min(self.max_block_size)
                .max(needed);
            self.push_block(grown)?;
            (tag_at, data_at, sentinel_end) = Self::layout(0, size, align)?;
            trace!(block_size = grown, blocks = self.blocks.len(), "arena grew");
        }
        let end = data_at + size;
        self.offset = end;
        let block = self.blocks.last_mut()?;
        debug_assert!(sentinel_end <= block.len());
        block[tag_at..tag_at + TAG_SIZE].copy_from_slice(&tag.to_le_bytes());
        Some(&mut block[data_at..end])
    }

    /// Terminates the current block and starts a new one of `size` bytes.
    fn push_block(&mut self, size: usize) -> Option<()> {
        let capacity = size.max(TAG_SIZE);
        let total = self.allocated.checked_add(capacity)?;
        if self.memory_limit.is_some_and(|limit| total > limit) {
            return None;
        }
        let block = new_block(capacity)?;
        self.terminate_current();
        self.blocks.push(block);
        self.offset = 0;
        self.allocated = total;
        Some(())
    }

    /// Writes [`END_OF_BLOCK`] after the last record of the current block.
    fn terminate_current(&mut self) {
        let Some(at) = align_up(self.offset, TAG_SIZE) else {
            return;
        };
        if let Some(slot) = self
            .blocks
            .last_mut()
            .and_then(|b| b.get_mut(at..at + TAG_SIZE))
        {
            slot.copy_from_slice(&END_OF_BLOCK.to_le_bytes());
        }
    }

    /// Records the current write position.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            blocks: self.blocks.len(),
            offset: self.offset,
        }
    }

    /// Discards everything written after `checkpoint`.
    pub fn rewind(&mut self, checkpoint: Checkpoint) {
        while self.blocks.len() > checkpoint.blocks {
            if let Some(block) = self.blocks.pop() {
                self.allocated -= block.len();
            }
        }
        self.offset = checkpoint.offset;
    }

    /// Terminates the chain and moves every block out. The allocator is left
    /// empty.
    pub fn acquire_blocks(&mut self) -> CommandBlocks {
        self.terminate_current();
        let blocks = std::mem::take(&mut self.blocks);
        self.reset();
        CommandBlocks { blocks }
    }

    /// Drops every record and block.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.offset = 0;
        self.allocated = 0;
    }
}

impl Default for CommandAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Sequential reader over [`CommandBlocks`].
#[derive(Debug)]
pub struct CommandIterator {
    /// Blocks being read.
    blocks: Vec<Vec<u8>>,
    /// Index of the current block.
    block: usize,
    /// Read offset in the current block.
    offset: usize,
}

impl CommandIterator {
    /// Starts reading at the first record.
    pub fn new(blocks: CommandBlocks) -> Self {
        Self {
            blocks: blocks.blocks,
            block: 0,
            offset: 0,
        }
    }

    /// Reads the next tag, following block terminators. `None` at the end.
    pub fn next_command_id(&mut self) -> Option<u32> {
        loop {
            let block = self.blocks.get(self.block)?;
            let at = align_up(self.offset, TAG_SIZE)?;
            let bytes: [u8; TAG_SIZE] = block.get(at..at + TAG_SIZE)?.try_into().ok()?;
            let tag = u32::from_le_bytes(bytes);
            if tag == END_OF_BLOCK {
                self.block += 1;
                self.offset = 0;
                continue;
            }
            self.offset = at + TAG_SIZE;
            return Some(tag);
        }
    }

    /// Reads the payload of the record whose tag was just read.
    ///
    /// Returns `None` if the request would run past the block.
    pub fn next_command(&mut self, size: usize, align: usize) -> Option<&[u8]> {
        let block = self.blocks.get(self.block)?;
        let at = align_up(self.offset, align)?;
        let bytes = block.get(at..at.checked_add(size)?)?;
        self.offset = at + size;
        Some(bytes)
    }

    /// Reads a continuation record written by
    /// [`CommandAllocator::allocate_data`].
    pub fn next_data(&mut self, size: usize, align: usize) -> Option<&[u8]> {
        let tag = self.next_command_id()?;
        debug_assert_eq!(tag, ADDITIONAL_DATA);
        if tag != ADDITIONAL_DATA {
            return None;
        }
        self.next_command(size, align)
    }
}
