//! The transfer codec contract shared by every record.
//!
//! A serialized command is laid out as
//!
//! ```text
//! [u32 command_size][u32 tag][fixed header][payload]
//! ```
//!
//! The fixed header holds the `self` and `result` handles, every value
//! member and one `u64` length per pointer member. Its size never depends on
//! the payload, so a reader knows where the payload starts before touching
//! it. The payload holds string bytes and array elements in declaration
//! order; arrays of structures store the element headers contiguously,
//! followed by each element's own payload.
//!
//! Decoding is split in two steps. [`Decode`] is purely structural and
//! yields a record whose object members are still [`ObjectHandle`]s; every
//! malformed input is a fatal [`WireError`]. [`resolve`] then translates the
//! handles through an [`IdResolver`], which is where the recoverable
//! *error object* outcome comes from.

use std::mem::size_of;

use crate::cursor::{ByteCursor, WireWriter};
use crate::error::{WireError, WireResult};
use crate::handle::{ObjectHandle, ObjectKind};

/// Size of the `[command_size][tag]` envelope.
pub const ENVELOPE_SIZE: usize = 8;

/// Translates in-memory objects to wire handles while encoding.
pub trait IdProvider<O> {
    /// Returns the handle of a required object.
    fn get_id(&self, kind: ObjectKind, object: &O) -> WireResult<ObjectHandle>;

    /// Returns the handle of an optional object, [`ObjectHandle::NULL`] when absent.
    fn get_optional_id(&self, kind: ObjectKind, object: Option<&O>) -> WireResult<ObjectHandle> {
        object.map_or(Ok(ObjectHandle::NULL), |o| self.get_id(kind, o))
    }
}

/// Outcome of looking an object up by handle.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LookupOutcome<T> {
    /// The object exists and is valid.
    Found(T),
    /// The object exists but its creation failed.
    Invalid,
    /// No live object has this handle (never created, destroyed, or stale).
    NotFound,
    /// The handle can never be valid.
    Malformed,
}

/// Translates wire handles back to objects while decoding.
pub trait IdResolver<T> {
    /// Looks `handle` up in the table for `kind`.
    fn resolve(&self, kind: ObjectKind, handle: ObjectHandle) -> LookupOutcome<T>;
}

/// Passes handles through unchanged; used for records whose objects are
/// already expressed as handles.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandleIds;

impl IdProvider<ObjectHandle> for HandleIds {
    fn get_id(&self, kind: ObjectKind, object: &ObjectHandle) -> WireResult<ObjectHandle> {
        if object.is_null() {
            return Err(WireError::NullObject(kind));
        }
        Ok(*object)
    }
}

/// Fixed layout information of a record.
pub trait Layout {
    /// Size of the fixed transfer header, envelope excluded.
    const HEADER_SIZE: usize;
}

/// Encoding half of the codec, generic over the in-memory object type `O`.
pub trait Transfer<O>: Layout {
    /// Payload bytes needed after the header, nested records included.
    fn extra_size(&self) -> WireResult<usize>;

    /// Writes the fixed header into `header` and pointer members into `payload`.
    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()>;
}

/// Structural decoding half of the codec.
pub trait Decode: Layout + Sized {
    /// Reads a record whose header is in `header` and pointer members in `payload`.
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self>;
}

/// A top-level record with a command tag.
pub trait Command: Layout {
    /// Tag written after the size in the envelope.
    const TAG: u32;

    /// The object the caller pre-assigned for the call's result, if any.
    fn result(&self) -> Option<(ObjectKind, ObjectHandle)> {
        None
    }
}

/// Which position an object member occupies in its command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Role {
    /// The object the method is invoked on.
    Target,
    /// Any other object member.
    Argument,
}

/// Re-expresses the object members of a decoded record.
pub trait MapObjects: Sized {
    /// The same record with objects of type `T`.
    type Mapped<T>;

    /// Maps every object member through `f`, `self` first, stopping at the first error.
    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<Self::Mapped<T>, E>;
}

/// Result of resolving a decoded record's objects.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Resolved<R> {
    /// Every object resolved to a valid one.
    Ready(R),
    /// An argument (or an invalid self) names an object that is unknown or
    /// invalid; the call must be skipped, not the connection.
    ErrorObject,
}

impl<R> Resolved<R> {
    /// The resolved record, or `None` for an error object.
    pub fn into_ready(self) -> Option<R> {
        match self {
            Self::Ready(r) => Some(r),
            Self::ErrorObject => None,
        }
    }
}

/// Internal short-circuit value of [`resolve`].
enum Unresolved {
    /// Recoverable.
    ErrorObject,
    /// Fatal.
    Fatal(WireError),
}

/// Resolves every object of `record` through `resolver`.
///
/// A missing `self` is fatal; a missing or invalid argument yields
/// [`Resolved::ErrorObject`].
pub fn resolve<C: MapObjects, T, R: IdResolver<T> + ?Sized>(
    record: C,
    resolver: &R,
) -> WireResult<Resolved<C::Mapped<T>>> {
    let mut lookup = |kind: ObjectKind, handle: ObjectHandle, role: Role| match resolver
        .resolve(kind, handle)
    {
        LookupOutcome::Found(object) => Ok(object),
        LookupOutcome::Invalid => Err(Unresolved::ErrorObject),
        LookupOutcome::NotFound if role == Role::Target => {
            Err(Unresolved::Fatal(WireError::MissingSelf { kind, handle }))
        }
        LookupOutcome::NotFound => Err(Unresolved::ErrorObject),
        LookupOutcome::Malformed => Err(Unresolved::Fatal(WireError::InvalidValue("object handle"))),
    };
    match record.map_objects(&mut lookup) {
        Ok(mapped) => Ok(Resolved::Ready(mapped)),
        Err(Unresolved::ErrorObject) => Ok(Resolved::ErrorObject),
        Err(Unresolved::Fatal(e)) => Err(e),
    }
}

/// Budgeted scratch memory for decoded pointer members.
///
/// Decoded arrays and strings are owned `Vec`s and `String`s; this type
/// charges them against a per-cycle budget and turns allocation failure into
/// a fatal error instead of an abort. [`reset`](Self::reset) is called after
/// every command.
#[derive(Debug, Clone)]
pub struct DeserializeAllocator {
    /// Maximum bytes handed out between resets.
    budget: usize,
    /// Bytes handed out since the last reset.
    used: usize,
}

impl DeserializeAllocator {
    /// Creates an allocator that hands out at most `budget` bytes per cycle.
    pub const fn new(budget: usize) -> Self {
        Self { budget, used: 0 }
    }

    /// Bytes handed out since the last reset.
    pub const fn used(&self) -> usize {
        self.used
    }

    /// Releases the whole budget for the next command.
    pub const fn reset(&mut self) {
        self.used = 0;
    }

    /// Charges `bytes` against the budget.
    fn charge(&mut self, bytes: usize) -> WireResult<()> {
        let used = self
            .used
            .checked_add(bytes)
            .filter(|&u| u <= self.budget)
            .ok_or(WireError::AllocationFailed(bytes))?;
        self.used = used;
        Ok(())
    }

    /// Returns an empty vector with room for `count` elements.
    pub fn vec<T>(&mut self, count: usize) -> WireResult<Vec<T>> {
        let bytes = count
            .checked_mul(size_of::<T>().max(1))
            .ok_or(WireError::LengthOverflow)?;
        self.charge(bytes)?;
        let mut v = Vec::new();
        v.try_reserve_exact(count)
            .map_err(|_| WireError::AllocationFailed(bytes))?;
        Ok(v)
    }

    /// Copies wire bytes into an owned, UTF-8 checked string.
    pub fn string(&mut self, bytes: &[u8]) -> WireResult<String> {
        let mut v = self.vec::<u8>(bytes.len())?;
        v.extend_from_slice(bytes);
        String::from_utf8(v).map_err(|_| WireError::InvalidValue("utf-8 string"))
    }
}

/// Total wire size of a command: envelope, header and payload.
pub fn required_size<O, C: Transfer<O>>(record: &C) -> WireResult<usize> {
    (ENVELOPE_SIZE + C::HEADER_SIZE)
        .checked_add(record.extra_size()?)
        .ok_or(WireError::LengthOverflow)
}

/// Serializes `record` into `out`, which must be exactly
/// [`required_size`] bytes long.
pub fn serialize_command<O, C: Transfer<O> + Command, P: IdProvider<O>>(
    record: &C,
    out: &mut [u8],
    ids: &P,
) -> WireResult<()> {
    let size = u32::try_from(out.len()).map_err(|_| WireError::LengthOverflow)?;
    let mut w = WireWriter::new(out);
    w.put_u32(size)?;
    w.put_u32(C::TAG)?;
    let mut header = w.split(C::HEADER_SIZE)?;
    record.serialize(&mut header, &mut w, ids)?;
    if !header.is_full() || !w.is_full() {
        return Err(WireError::BadCommandSize {
            declared: size as usize,
            expected: size as usize - header.remaining() - w.remaining(),
        });
    }
    Ok(())
}

/// Convenience wrapper returning the serialized command as a new vector.
pub fn encode_command<O, C: Transfer<O> + Command, P: IdProvider<O>>(
    record: &C,
    ids: &P,
) -> WireResult<Vec<u8>> {
    let mut out = vec![0u8; required_size(record)?];
    serialize_command(record, &mut out, ids)?;
    Ok(out)
}

/// Reads the `(command_size, tag)` envelope at the start of `bytes`.
pub fn peek_envelope(bytes: &[u8]) -> WireResult<(usize, u32)> {
    let c = ByteCursor::new(bytes);
    let size = c.peek_u32(0)? as usize;
    let tag = c.peek_u32(4)?;
    Ok((size, tag))
}

/// Decodes one complete command. `bytes` must span exactly the command.
pub fn deserialize_command<C: Decode + Command>(
    bytes: &[u8],
    alloc: &mut DeserializeAllocator,
) -> WireResult<C> {
    let mut c = ByteCursor::new(bytes);
    let declared = c.read_u32()? as usize;
    let tag = c.read_u32()?;
    if tag != C::TAG {
        return Err(WireError::UnknownCommand(tag));
    }
    if declared != bytes.len() {
        return Err(WireError::BadCommandSize {
            declared,
            expected: bytes.len(),
        });
    }
    let mut header = c.split(C::HEADER_SIZE)?;
    let record = C::deserialize(&mut header, &mut c, alloc)?;
    if !c.is_empty() {
        return Err(WireError::BadCommandSize {
            declared,
            expected: declared - c.remaining(),
        });
    }
    Ok(record)
}

/// `count × elem_size` with overflow checking.
pub(crate) fn array_size(count: usize, elem_size: usize) -> WireResult<usize> {
    count
        .checked_mul(elem_size)
        .ok_or(WireError::LengthOverflow)
}

/// Sums payload sizes with overflow checking.
pub(crate) fn sum_sizes(sizes: impl IntoIterator<Item = WireResult<usize>>) -> WireResult<usize> {
    sizes.into_iter().try_fold(0usize, |acc, s| {
        acc.checked_add(s?).ok_or(WireError::LengthOverflow)
    })
}

/// Payload size of an array of nested records: element headers, then their payloads.
pub(crate) fn records_extra_size<O, T: Transfer<O>>(items: &[T]) -> WireResult<usize> {
    let headers = array_size(items.len(), T::HEADER_SIZE)?;
    let nested = sum_sizes(items.iter().map(Transfer::extra_size))?;
    headers.checked_add(nested).ok_or(WireError::LengthOverflow)
}

/// Writes an array of nested records into `payload`.
///
/// The element headers are laid out contiguously first; every element's own
/// pointer members follow in order.
pub(crate) fn put_records<O, T: Transfer<O>>(
    payload: &mut WireWriter<'_>,
    items: &[T],
    ids: &dyn IdProvider<O>,
) -> WireResult<()> {
    let mut headers = payload.split(array_size(items.len(), T::HEADER_SIZE)?)?;
    for item in items {
        item.serialize(&mut headers, payload, ids)?;
    }
    Ok(())
}

/// Reads `count` nested records from `payload`.
pub(crate) fn read_records<T: Decode>(
    payload: &mut ByteCursor<'_>,
    count: usize,
    alloc: &mut DeserializeAllocator,
) -> WireResult<Vec<T>> {
    // Bounds-check the headers before allocating for them.
    let mut headers = payload.split(array_size(count, T::HEADER_SIZE)?)?;
    let mut out = alloc.vec(count)?;
    for _ in 0..count {
        out.push(T::deserialize(&mut headers, payload, alloc)?);
    }
    Ok(out)
}

/// Writes an array of required objects into `payload`.
pub(crate) fn put_object_array<O>(
    payload: &mut WireWriter<'_>,
    kind: ObjectKind,
    objects: &[O],
    ids: &dyn IdProvider<O>,
) -> WireResult<()> {
    objects
        .iter()
        .try_for_each(|o| put_object(payload, kind, o, ids))
}

/// Reads `count` required object handles from `payload`.
pub(crate) fn read_object_array(
    payload: &mut ByteCursor<'_>,
    kind: ObjectKind,
    count: usize,
    alloc: &mut DeserializeAllocator,
) -> WireResult<Vec<ObjectHandle>> {
    let mut handles = payload.split(array_size(count, ObjectHandle::SIZE)?)?;
    let mut out = alloc.vec(count)?;
    for _ in 0..count {
        out.push(read_object(&mut handles, kind)?);
    }
    Ok(out)
}

/// Reads `len` raw payload bytes into an owned buffer.
pub(crate) fn read_byte_array(
    payload: &mut ByteCursor<'_>,
    len: usize,
    alloc: &mut DeserializeAllocator,
) -> WireResult<Vec<u8>> {
    let bytes = payload.read_bytes(len)?;
    let mut out = alloc.vec(len)?;
    out.extend_from_slice(bytes);
    Ok(out)
}

/// Maps a list of argument objects.
pub(crate) fn map_object_array<T, E>(
    kind: ObjectKind,
    handles: Vec<ObjectHandle>,
    f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
) -> Result<Vec<T>, E> {
    handles
        .into_iter()
        .map(|h| f(kind, h, Role::Argument))
        .collect()
}

/// Maps an optional argument object.
pub(crate) fn map_optional<T, E>(
    kind: ObjectKind,
    handle: Option<ObjectHandle>,
    f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
) -> Result<Option<T>, E> {
    handle.map(|h| f(kind, h, Role::Argument)).transpose()
}

/// Writes an optional string's `has` flag and length into the header.
pub(crate) fn put_optional_str_header(header: &mut WireWriter<'_>, s: Option<&str>) -> WireResult<()> {
    header.put_bool(s.is_some())?;
    header.put_len(s.map_or(0, str::len))
}

/// Reads an optional string header: `Some(len)` when present.
pub(crate) fn read_optional_str_header(header: &mut ByteCursor<'_>) -> WireResult<Option<usize>> {
    let present = header.read_bool()?;
    let len = header.read_len()?;
    match (present, len) {
        (true, len) => Ok(Some(len)),
        (false, 0) => Ok(None),
        (false, _) => Err(WireError::InvalidValue("absent string with length")),
    }
}

/// Reads `len` payload bytes as a string.
pub(crate) fn read_string(
    payload: &mut ByteCursor<'_>,
    len: usize,
    alloc: &mut DeserializeAllocator,
) -> WireResult<String> {
    let bytes = payload.read_bytes(len)?;
    alloc.string(bytes)
}

/// Reads an optional string whose header has already been read.
pub(crate) fn read_optional_string(
    payload: &mut ByteCursor<'_>,
    len: Option<usize>,
    alloc: &mut DeserializeAllocator,
) -> WireResult<Option<String>> {
    len.map(|l| read_string(payload, l, alloc)).transpose()
}

/// Writes a required object member.
pub(crate) fn put_object<O>(
    header: &mut WireWriter<'_>,
    kind: ObjectKind,
    object: &O,
    ids: &dyn IdProvider<O>,
) -> WireResult<()> {
    let handle = ids.get_id(kind, object)?;
    if handle.is_null() {
        return Err(WireError::NullObject(kind));
    }
    header.put_handle(handle)
}

/// Writes an optional object member.
pub(crate) fn put_optional_object<O>(
    header: &mut WireWriter<'_>,
    kind: ObjectKind,
    object: Option<&O>,
    ids: &dyn IdProvider<O>,
) -> WireResult<()> {
    header.put_handle(ids.get_optional_id(kind, object)?)
}

/// Reads an optional object handle; a live id with generation 0 is malformed.
pub(crate) fn read_optional_object(
    cursor: &mut ByteCursor<'_>,
) -> WireResult<Option<ObjectHandle>> {
    let handle = cursor.read_handle()?;
    if handle.is_null() {
        return Ok(None);
    }
    if handle.generation == 0 {
        return Err(WireError::InvalidValue("object handle"));
    }
    Ok(Some(handle))
}

/// Reads a required object handle.
pub(crate) fn read_object(cursor: &mut ByteCursor<'_>, kind: ObjectKind) -> WireResult<ObjectHandle> {
    read_optional_object(cursor)?.ok_or(WireError::NullObject(kind))
}

/// Reads the handle a caller pre-assigned for a result object.
pub(crate) fn read_result(cursor: &mut ByteCursor<'_>, kind: ObjectKind) -> WireResult<ObjectHandle> {
    read_object(cursor, kind)
}
