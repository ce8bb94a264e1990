//! Outgoing command staging.
//!
//! Each endpoint serializes records into its own [`CommandAllocator`] and
//! only turns them into transmissions on flush. A staged record is an arena
//! record holding the command size, followed by an
//! [`ADDITIONAL_DATA`](crate::arena::ADDITIONAL_DATA) record holding the
//! serialized command.

use gpuwire_proto::{Command, IdProvider, Transfer, WireError, WireResult, chunks, codec};
use tracing::trace;

use crate::arena::{CommandAllocator, CommandIterator};
use crate::config::WireConfig;
use crate::transport::Transport;

/// Arena tag of a staged command.
const STAGED_COMMAND: u32 = 1;

/// Serialized commands waiting to be flushed.
#[derive(Debug)]
pub struct CommandStaging {
    /// Backing arena.
    arena: CommandAllocator,
    /// Bytes of serialized commands staged since the last flush.
    staged_bytes: usize,
    /// Stream left over from a flush whose transport failed. Goes out ahead
    /// of anything staged later.
    unsent: Vec<u8>,
}

impl CommandStaging {
    /// Creates an empty staging area sized by `config`.
    pub const fn new(config: &WireConfig) -> Self {
        Self {
            arena: CommandAllocator::with_block_sizes(
                config.initial_block_size,
                config.max_block_size,
            )
            .memory_limit(config.staging_limit),
            staged_bytes: 0,
            unsent: Vec::new(),
        }
    }

    /// Bytes waiting to be flushed.
    pub const fn staged_bytes(&self) -> usize {
        self.staged_bytes + self.unsent.len()
    }

    /// Returns `true` if nothing is waiting.
    pub const fn is_empty(&self) -> bool {
        self.staged_bytes() == 0
    }

    /// Serializes `command` at the end of the staging area.
    ///
    /// On failure nothing is staged.
    pub fn stage<O, C, P>(&mut self, command: &C, ids: &P) -> WireResult<()>
    where
        C: Transfer<O> + Command,
        P: IdProvider<O>,
    {
        let size = codec::required_size(command)?;
        let size_field = u32::try_from(size).map_err(|_| WireError::LengthOverflow)?;
        let checkpoint = self.arena.checkpoint();
        let result = self.write(command, ids, size, size_field);
        if result.is_err() {
            self.arena.rewind(checkpoint);
        } else {
            self.staged_bytes += size;
            trace!(tag = C::TAG, size, "staged command");
        }
        result
    }

    /// Writes the two arena records of one command.
    fn write<O, C, P>(&mut self, command: &C, ids: &P, size: usize, size_field: u32) -> WireResult<()>
    where
        C: Transfer<O> + Command,
        P: IdProvider<O>,
    {
        self.arena
            .allocate(STAGED_COMMAND, 4, 4)
            .ok_or(WireError::AllocationFailed(4))?
            .copy_from_slice(&size_field.to_le_bytes());
        let out = self
            .arena
            .allocate_data(size, 8)
            .ok_or(WireError::AllocationFailed(size))?;
        codec::serialize_command(command, out, ids)
    }

    /// Moves every staged command out as one contiguous stream.
    pub fn take(&mut self) -> Vec<u8> {
        let mut stream = std::mem::take(&mut self.unsent);
        stream.reserve(self.staged_bytes);
        let mut it = CommandIterator::new(self.arena.acquire_blocks());
        while let Some(tag) = it.next_command_id() {
            debug_assert_eq!(tag, STAGED_COMMAND);
            let Some(size) = it
                .next_command(4, 4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
            else {
                break;
            };
            let Some(bytes) = it.next_data(size as usize, 8) else {
                break;
            };
            stream.extend_from_slice(bytes);
        }
        self.staged_bytes = 0;
        stream
    }

    /// Sends every staged command, split into transmissions of at most
    /// `max_chunk_size` bytes.
    ///
    /// If the transport fails, the bytes of the failed transmission and
    /// everything after it stay staged for the next flush.
    pub fn flush<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        max_chunk_size: usize,
    ) -> std::io::Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let mut stream = self.take();
        let mut sent = 0;
        let result = chunks(&stream, max_chunk_size).try_for_each(|chunk| {
            trace!(len = chunk.len(), "sending chunk");
            transport.send(chunk)?;
            sent += chunk.len();
            Ok(())
        });
        if result.is_err() {
            stream.drain(..sent);
            self.unsent = stream;
        }
        result
    }

    /// Drops everything staged.
    pub fn clear(&mut self) {
        self.arena.reset();
        self.staged_bytes = 0;
        self.unsent.clear();
    }
}
