//! Reassembly of commands that span several deliveries.
//!
//! There is no separate chunk header: the `command_size` field of the
//! envelope says how many bytes belong to the command. When a delivery ends
//! in the middle of a command, the receiver copies the partial bytes into a
//! [`ChunkedReassembler`] and keeps feeding it subsequent deliveries until
//! the declared size is reached.

use tracing::trace;

use crate::codec::ENVELOPE_SIZE;
use crate::cursor::ByteCursor;
use crate::error::{WireError, WireResult};

/// What [`ChunkedReassembler::feed`] did with a delivery.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChunkOutcome {
    /// No reassembly in flight; the delivery should be dispatched as is.
    Passthrough,
    /// The whole delivery was absorbed and the command is still incomplete.
    Consumed,
    /// The command is complete.
    Complete {
        /// Every byte of the reassembled command, envelope included.
        command: Vec<u8>,
        /// Bytes of the delivery that belonged to the command.
        used: usize,
    },
}

/// A command being reassembled.
#[derive(Debug)]
struct Pending {
    /// Bytes received so far.
    buf: Vec<u8>,
    /// Declared size, once the whole envelope has arrived.
    declared: Option<usize>,
}

/// Buffers at most one partially received command per connection.
#[derive(Debug)]
pub struct ChunkedReassembler {
    /// Largest command accepted.
    max_command_size: usize,
    /// The reassembly in flight.
    pending: Option<Pending>,
}

impl ChunkedReassembler {
    /// Creates a reassembler accepting commands of up to `max_command_size` bytes.
    pub const fn new(max_command_size: usize) -> Self {
        Self {
            max_command_size,
            pending: None,
        }
    }

    /// Returns `true` while a command is being reassembled.
    pub const fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Bytes buffered for the command in flight.
    pub fn buffered(&self) -> usize {
        self.pending.as_ref().map_or(0, |p| p.buf.len())
    }

    /// Validates a declared command size.
    fn check_size(max_command_size: usize, declared: usize) -> WireResult<usize> {
        if declared < ENVELOPE_SIZE {
            return Err(WireError::Chunk("command size smaller than its envelope"));
        }
        if declared > max_command_size {
            return Err(WireError::Chunk("command size over the configured limit"));
        }
        Ok(declared)
    }

    /// Starts reassembling from the incomplete command at the end of a delivery.
    ///
    /// `partial` may be shorter than the envelope itself.
    pub fn begin(&mut self, partial: &[u8]) -> WireResult<()> {
        if self.pending.is_some() {
            return Err(WireError::Chunk("reassembly already in flight"));
        }
        let declared = if partial.len() >= ENVELOPE_SIZE {
            let size = ByteCursor::new(partial).peek_u32(0)? as usize;
            let size = Self::check_size(self.max_command_size, size)?;
            if partial.len() >= size {
                return Err(WireError::Chunk("command is already complete"));
            }
            Some(size)
        } else {
            None
        };
        let mut buf = Vec::new();
        buf.try_reserve_exact(declared.unwrap_or(ENVELOPE_SIZE))
            .map_err(|_| WireError::AllocationFailed(declared.unwrap_or(ENVELOPE_SIZE)))?;
        buf.extend_from_slice(partial);
        trace!(buffered = buf.len(), ?declared, "chunked command started");
        self.pending = Some(Pending { buf, declared });
        Ok(())
    }

    /// Feeds the next delivery.
    ///
    /// Errors are fatal and leave the reassembler empty.
    pub fn feed(&mut self, bytes: &[u8]) -> WireResult<ChunkOutcome> {
        let result = self.feed_inner(bytes);
        if result.is_err() {
            self.pending = None;
        }
        result
    }

    /// Body of [`feed`](Self::feed).
    fn feed_inner(&mut self, bytes: &[u8]) -> WireResult<ChunkOutcome> {
        let max_command_size = self.max_command_size;
        let Some(p) = self.pending.as_mut() else {
            return Ok(ChunkOutcome::Passthrough);
        };
        let mut used = 0;
        let declared = match p.declared {
            Some(declared) => declared,
            None => {
                let take = (ENVELOPE_SIZE - p.buf.len()).min(bytes.len());
                p.buf.extend_from_slice(&bytes[..take]);
                used = take;
                if p.buf.len() < ENVELOPE_SIZE {
                    return Ok(ChunkOutcome::Consumed);
                }
                let size = ByteCursor::new(&p.buf).peek_u32(0)? as usize;
                let declared = Self::check_size(max_command_size, size)?;
                p.buf
                    .try_reserve_exact(declared - p.buf.len())
                    .map_err(|_| WireError::AllocationFailed(declared))?;
                p.declared = Some(declared);
                declared
            }
        };
        let take = (declared - p.buf.len()).min(bytes.len() - used);
        p.buf.extend_from_slice(&bytes[used..used + take]);
        used += take;
        trace!(buffered = p.buf.len(), declared, "chunk absorbed");
        if p.buf.len() < declared {
            return Ok(ChunkOutcome::Consumed);
        }
        let command = self.pending.take().map(|p| p.buf).unwrap_or_default();
        Ok(ChunkOutcome::Complete { command, used })
    }
}

/// Splits staged bytes into transmissions of at most `max_chunk_size` bytes.
pub fn chunks(bytes: &[u8], max_chunk_size: usize) -> std::slice::Chunks<'_, u8> {
    bytes.chunks(max_chunk_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(len: usize) -> Vec<u8> {
        let mut bytes = vec![0xab; len];
        bytes[..4].copy_from_slice(&u32::try_from(len).unwrap().to_le_bytes());
        bytes[4..8].copy_from_slice(&1u32.to_le_bytes());
        bytes
    }

    #[test]
    fn idle_reassembler_passes_through() {
        let mut r = ChunkedReassembler::new(1024);
        assert_eq!(r.feed(&[1, 2, 3]).unwrap(), ChunkOutcome::Passthrough);
    }

    #[test]
    fn reassembles_across_three_deliveries() {
        let cmd = command(100);
        let mut r = ChunkedReassembler::new(1024);
        r.begin(&cmd[..30]).unwrap();
        assert_eq!(r.feed(&cmd[30..60]).unwrap(), ChunkOutcome::Consumed);
        assert_eq!(r.buffered(), 60);

        let mut tail = cmd[60..].to_vec();
        tail.extend_from_slice(&[9, 9]);
        match r.feed(&tail).unwrap() {
            ChunkOutcome::Complete { command, used } => {
                assert_eq!(command, cmd);
                assert_eq!(used, 40);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!r.is_pending());
    }

    #[test]
    fn partial_envelope_is_buffered() {
        let cmd = command(20);
        let mut r = ChunkedReassembler::new(1024);
        r.begin(&cmd[..3]).unwrap();
        assert_eq!(r.feed(&cmd[3..5]).unwrap(), ChunkOutcome::Consumed);
        assert_eq!(
            r.feed(&cmd[5..]).unwrap(),
            ChunkOutcome::Complete {
                command: cmd.clone(),
                used: 15
            }
        );
    }

    #[test]
    fn oversized_or_undersized_declarations_are_fatal() {
        let mut r = ChunkedReassembler::new(64);
        assert!(r.begin(&command(65)[..10]).is_err());

        let mut tiny = command(16);
        tiny[..4].copy_from_slice(&4u32.to_le_bytes());
        assert!(r.begin(&tiny[..2]).is_ok());
        assert!(r.feed(&tiny[2..10]).is_err());
        assert!(!r.is_pending());
    }

    #[test]
    fn only_one_reassembly_at_a_time() {
        let cmd = command(40);
        let mut r = ChunkedReassembler::new(64);
        r.begin(&cmd[..10]).unwrap();
        assert!(r.begin(&cmd[..10]).is_err());
    }

    #[test]
    fn chunks_respect_limit() {
        let bytes = [0u8; 10];
        let sizes: Vec<_> = chunks(&bytes, 4).map(<[u8]>::len).collect();
        assert_eq!(sizes, [4, 4, 2]);
    }
}
