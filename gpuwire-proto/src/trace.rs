//! Recorded wire traffic.
//!
//! A trace file is a sequence of frames: `[u32 big-endian length][postcard
//! payload]`, each payload one [`TraceEntry`] holding exactly the bytes of
//! one transmission.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

/// Maximum allowed frame payload (16 MiB).
const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Which way a transmission travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Direction {
    /// Client to server.
    Forward,
    /// Server to client.
    Return,
}

/// One recorded transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Which way the bytes went.
    pub direction: Direction,
    /// Bytes handed to the transport.
    pub bytes: Vec<u8>,
}

/// Encodes `msg` as a length-prefixed postcard frame and writes it to `w`.
pub fn encode<W: Write>(w: &mut W, msg: &impl Serialize) -> io::Result<()> {
    let payload =
        postcard::to_allocvec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len <= MAX_FRAME)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds 16 MiB limit"))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(&payload)?;
    w.flush()
}

/// Reads a length-prefixed postcard frame from `r` and decodes it.
pub fn decode<T: for<'de> Deserialize<'de>>(r: &mut impl Read) -> io::Result<T> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    decode_body(u32::from_be_bytes(buf), r)
}

/// Reads and decodes the payload of a frame whose length is already known.
fn decode_body<T: for<'de> Deserialize<'de>>(len: u32, r: &mut impl Read) -> io::Result<T> {
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    postcard::from_bytes(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Reads every entry of a trace. A clean end of input between frames ends
/// the trace; anything else is an error.
pub fn read_all(r: &mut impl Read) -> io::Result<Vec<TraceEntry>> {
    let mut entries = Vec::new();
    loop {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            match r.read(&mut buf[filled..])? {
                0 if filled == 0 => return Ok(entries),
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => filled += n,
            }
        }
        entries.push(decode_body(u32::from_be_bytes(buf), r)?);
    }
}
