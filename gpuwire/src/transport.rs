//! Byte channel between the endpoints.

use std::io::{self, Write};

use gpuwire_proto::trace::{self, Direction, TraceEntry};

/// A reliable, ordered byte channel.
///
/// Every call to [`send`](Self::send) is one transmission; the receiver must
/// hand transmissions to `handle_commands` in the same order.
pub trait Transport {
    /// Sends one transmission.
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Collects transmissions in memory.
impl Transport for Vec<Vec<u8>> {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.push(bytes.to_vec());
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).send(bytes)
    }
}

/// Wraps a transport and appends every transmission to a trace.
#[derive(Debug)]
pub struct TraceRecorder<T, W> {
    /// Transport the bytes are forwarded to.
    inner: T,
    /// Trace sink.
    sink: W,
    /// Direction recorded for every transmission.
    direction: Direction,
}

impl<T: Transport, W: Write> TraceRecorder<T, W> {
    /// Records transmissions of `inner` going `direction` into `sink`.
    pub const fn new(inner: T, sink: W, direction: Direction) -> Self {
        Self {
            inner,
            sink,
            direction,
        }
    }

    /// Returns the wrapped transport and the trace sink.
    pub fn into_parts(self) -> (T, W) {
        (self.inner, self.sink)
    }
}

impl<T: Transport, W: Write> Transport for TraceRecorder<T, W> {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let entry = TraceEntry {
            direction: self.direction,
            bytes: bytes.to_vec(),
        };
        trace::encode(&mut self.sink, &entry)?;
        self.inner.send(bytes)
    }
}
