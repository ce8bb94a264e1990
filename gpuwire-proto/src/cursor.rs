//! Checked little-endian reads and writes over byte regions.
//!
//! Every access to wire memory goes through [`ByteCursor`] (decode) or
//! [`WireWriter`] (encode). Both only ever shrink their region from the
//! front, so a successful read is always inside the original buffer.

use std::mem;

use crate::error::{WireError, WireResult};
use crate::handle::ObjectHandle;

/// Read cursor over an immutable byte region.
#[derive(Debug, Clone, Copy)]
pub struct ByteCursor<'a> {
    /// Bytes not yet consumed.
    bytes: &'a [u8],
}

impl<'a> ByteCursor<'a> {
    /// Creates a cursor over `bytes`.
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Number of unread bytes.
    pub const fn remaining(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` once every byte has been read.
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Unread bytes, without consuming them.
    pub const fn as_slice(&self) -> &'a [u8] {
        self.bytes
    }

    /// Consumes `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> WireResult<&'a [u8]> {
        if len > self.bytes.len() {
            return Err(WireError::Truncated {
                needed: len,
                available: self.bytes.len(),
            });
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    /// Consumes `len` bytes and returns them as a cursor of their own.
    pub fn split(&mut self, len: usize) -> WireResult<Self> {
        self.read_bytes(len).map(Self::new)
    }

    /// Consumes exactly `N` bytes.
    fn read_array<const N: usize>(&mut self) -> WireResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Reads a `u8`.
    pub fn read_u8(&mut self) -> WireResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&mut self) -> WireResult<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64(&mut self) -> WireResult<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    /// Reads a little-endian `f64`.
    pub fn read_f64(&mut self) -> WireResult<f64> {
        self.read_array().map(f64::from_le_bytes)
    }

    /// Reads a one-byte bool; anything but 0 or 1 is malformed.
    pub fn read_bool(&mut self) -> WireResult<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::InvalidValue("bool")),
        }
    }

    /// Reads an object handle.
    pub fn read_handle(&mut self) -> WireResult<ObjectHandle> {
        let id = self.read_u32()?;
        let generation = self.read_u32()?;
        Ok(ObjectHandle::new(id, generation))
    }

    /// Reads a `u64` length field and narrows it to `usize`.
    pub fn read_len(&mut self) -> WireResult<usize> {
        usize::try_from(self.read_u64()?).map_err(|_| WireError::LengthOverflow)
    }

    /// Reads a `u32` at `offset` without consuming anything.
    pub fn peek_u32(&self, offset: usize) -> WireResult<u32> {
        let mut ahead = *self;
        ahead.read_bytes(offset)?;
        ahead.read_u32()
    }
}

/// Write cursor over a pre-sized mutable byte region.
#[derive(Debug)]
pub struct WireWriter<'a> {
    /// Bytes not yet written.
    buf: &'a mut [u8],
}

impl<'a> WireWriter<'a> {
    /// Creates a writer over `buf`.
    pub const fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    /// Number of unwritten bytes.
    pub const fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` once the whole region has been written.
    pub const fn is_full(&self) -> bool {
        self.buf.is_empty()
    }

    /// Reserves the next `len` bytes as a writer of their own.
    pub fn split(&mut self, len: usize) -> WireResult<Self> {
        if len > self.buf.len() {
            return Err(WireError::Truncated {
                needed: len,
                available: self.buf.len(),
            });
        }
        let (head, tail) = mem::take(&mut self.buf).split_at_mut(len);
        self.buf = tail;
        Ok(Self { buf: head })
    }

    /// Copies `bytes` verbatim.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> WireResult<()> {
        self.split(bytes.len())?.buf.copy_from_slice(bytes);
        Ok(())
    }

    /// Writes a `u8`.
    pub fn put_u8(&mut self, value: u8) -> WireResult<()> {
        self.put_bytes(&[value])
    }

    /// Writes a little-endian `u32`.
    pub fn put_u32(&mut self, value: u32) -> WireResult<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Writes a little-endian `u64`.
    pub fn put_u64(&mut self, value: u64) -> WireResult<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Writes a little-endian `f64`.
    pub fn put_f64(&mut self, value: f64) -> WireResult<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Writes a one-byte bool.
    pub fn put_bool(&mut self, value: bool) -> WireResult<()> {
        self.put_u8(u8::from(value))
    }

    /// Writes an object handle.
    pub fn put_handle(&mut self, handle: ObjectHandle) -> WireResult<()> {
        self.put_u32(handle.id)?;
        self.put_u32(handle.generation)
    }

    /// Writes a length field as `u64`.
    pub fn put_len(&mut self, len: usize) -> WireResult<()> {
        self.put_u64(u64::try_from(len).map_err(|_| WireError::LengthOverflow)?)
    }
}
