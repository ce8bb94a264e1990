//! The receive loop shared by both endpoints.
//!
//! A delivery is a run of back-to-back commands, each starting with its
//! `[command_size][tag]` envelope. [`dispatch_complete`] walks the complete
//! commands and hands each one to a [`CommandHandler`]; [`Dispatcher`] adds
//! reassembly of a command that straddles deliveries.

use gpuwire_proto::{ChunkOutcome, ChunkedReassembler, ENVELOPE_SIZE, WireError, WireResult, codec};
use tracing::trace;

/// Executes one complete command.
pub trait CommandHandler {
    /// Decodes and executes `command`, which spans exactly one command.
    ///
    /// An error is fatal for the connection.
    fn handle_command(&mut self, command: &[u8]) -> WireResult<()>;
}

/// What happened to the bytes given to `handle_commands`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum HandleOutcome {
    /// Every byte was executed.
    Complete,
    /// Trailing bytes of an unfinished command are buffered until more arrive.
    Incomplete {
        /// Bytes of the unfinished command buffered so far.
        buffered: usize,
    },
}

/// Executes every complete command at the start of `bytes` and returns the
/// unconsumed tail, which is either empty or the beginning of a command.
pub fn dispatch_complete<'a, H: CommandHandler + ?Sized>(
    handler: &mut H,
    mut bytes: &'a [u8],
    max_command_size: usize,
) -> WireResult<&'a [u8]> {
    while bytes.len() >= ENVELOPE_SIZE {
        let (size, tag) = codec::peek_envelope(bytes)?;
        if size < ENVELOPE_SIZE {
            return Err(WireError::BadCommandSize {
                declared: size,
                expected: ENVELOPE_SIZE,
            });
        }
        if size > max_command_size {
            return Err(WireError::Chunk("command size over the configured limit"));
        }
        let Some((command, rest)) = bytes.split_at_checked(size) else {
            break;
        };
        trace!(tag, size, "dispatching command");
        handler.handle_command(command)?;
        bytes = rest;
    }
    Ok(bytes)
}

/// Per-connection receive state.
#[derive(Debug)]
pub struct Dispatcher {
    /// Command straddling deliveries, if any.
    reassembler: ChunkedReassembler,
    /// Largest command accepted.
    max_command_size: usize,
}

impl Dispatcher {
    /// Creates a dispatcher accepting commands of up to `max_command_size` bytes.
    pub const fn new(max_command_size: usize) -> Self {
        Self {
            reassembler: ChunkedReassembler::new(max_command_size),
            max_command_size,
        }
    }

    /// Returns `true` while part of a command is buffered.
    pub const fn is_pending(&self) -> bool {
        self.reassembler.is_pending()
    }

    /// Executes every command completed by `bytes`.
    pub fn handle_commands<H: CommandHandler + ?Sized>(
        &mut self,
        handler: &mut H,
        bytes: &[u8],
    ) -> WireResult<HandleOutcome> {
        let rest = match self.reassembler.feed(bytes)? {
            ChunkOutcome::Consumed => {
                return Ok(HandleOutcome::Incomplete {
                    buffered: self.reassembler.buffered(),
                });
            }
            ChunkOutcome::Complete { command, used } => {
                handler.handle_command(&command)?;
                &bytes[used..]
            }
            _ => bytes,
        };
        let tail = dispatch_complete(handler, rest, self.max_command_size)?;
        if tail.is_empty() {
            return Ok(HandleOutcome::Complete);
        }
        self.reassembler.begin(tail)?;
        Ok(HandleOutcome::Incomplete {
            buffered: tail.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records the size and tag of every command.
    #[derive(Default)]
    struct Recorder {
        seen: Vec<(usize, u32)>,
    }

    impl CommandHandler for Recorder {
        fn handle_command(&mut self, command: &[u8]) -> WireResult<()> {
            let (size, tag) = codec::peek_envelope(command)?;
            assert_eq!(size, command.len());
            self.seen.push((size, tag));
            Ok(())
        }
    }

    fn command(tag: u32, body: usize) -> Vec<u8> {
        let size = u32::try_from(ENVELOPE_SIZE + body).unwrap();
        let mut out = size.to_le_bytes().to_vec();
        out.extend_from_slice(&tag.to_le_bytes());
        out.resize(ENVELOPE_SIZE + body, 0xab);
        out
    }

    #[test]
    fn complete_commands_are_dispatched_in_order() {
        let stream = [command(1, 0), command(2, 12), command(3, 4)].concat();
        let mut handler = Recorder::default();
        let tail = dispatch_complete(&mut handler, &stream, 1024).unwrap();
        assert!(tail.is_empty());
        assert_eq!(handler.seen, [(8, 1), (20, 2), (12, 3)]);
    }

    #[test]
    fn truncated_command_is_left_as_tail() {
        let stream = [command(1, 0), command(2, 12)].concat();
        let mut handler = Recorder::default();
        let tail = dispatch_complete(&mut handler, &stream[..15], 1024).unwrap();
        assert_eq!(tail.len(), 7);
        assert_eq!(handler.seen, [(8, 1)]);
    }

    #[test]
    fn size_below_envelope_is_fatal() {
        let mut bad = command(1, 0);
        bad[..4].copy_from_slice(&4u32.to_le_bytes());
        let err = dispatch_complete(&mut Recorder::default(), &bad, 1024).unwrap_err();
        assert!(matches!(err, WireError::BadCommandSize { declared: 4, .. }));
    }

    #[test]
    fn oversized_command_is_fatal() {
        let big = command(1, 100);
        let err = dispatch_complete(&mut Recorder::default(), &big, 64).unwrap_err();
        assert!(matches!(err, WireError::Chunk(_)));
    }

    #[test]
    fn command_split_across_deliveries() {
        let stream = [command(1, 40), command(2, 0)].concat();
        let mut dispatcher = Dispatcher::new(1024);
        let mut handler = Recorder::default();
        let mut outcomes = Vec::new();
        for delivery in stream.chunks(5) {
            outcomes.push(dispatcher.handle_commands(&mut handler, delivery).unwrap());
        }
        assert_eq!(handler.seen, [(48, 1), (8, 2)]);
        assert_eq!(outcomes.last(), Some(&HandleOutcome::Complete));
        assert!(
            outcomes
                .iter()
                .any(|o| matches!(o, HandleOutcome::Incomplete { .. }))
        );
        assert!(!dispatcher.is_pending());
    }

    #[test]
    fn split_envelope_is_reassembled() {
        let stream = command(7, 3);
        let mut dispatcher = Dispatcher::new(1024);
        let mut handler = Recorder::default();
        assert_eq!(
            dispatcher.handle_commands(&mut handler, &stream[..2]).unwrap(),
            HandleOutcome::Incomplete { buffered: 2 }
        );
        assert_eq!(
            dispatcher.handle_commands(&mut handler, &stream[2..]).unwrap(),
            HandleOutcome::Complete
        );
        assert_eq!(handler.seen, [(11, 7)]);
    }
}
