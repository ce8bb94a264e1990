//! Fatal protocol errors.

use crate::handle::{ObjectHandle, ObjectKind};

/// Alias for `Result<T, WireError>`.
pub type WireResult<T> = std::result::Result<T, WireError>;

/// A protocol violation. Every variant is fatal: the connection that produced
/// it must be torn down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum WireError {
    /// A read or write ran past the end of its region.
    #[error("truncated: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes the operation required.
        needed: usize,
        /// Bytes left in the region.
        available: usize,
    },

    /// The command tag is not known to this endpoint.
    #[error("unknown command tag {0:#x}")]
    UnknownCommand(u32),

    /// The command envelope declares an impossible size.
    #[error("bad command size: declared {declared}, expected {expected}")]
    BadCommandSize {
        /// Size written in the envelope.
        declared: usize,
        /// Size implied by the decoded record.
        expected: usize,
    },

    /// A length field does not fit the address space or overflows a size computation.
    #[error("length overflow")]
    LengthOverflow,

    /// The scratch allocator or the staging arena could not provide memory.
    #[error("allocation of {0} bytes failed")]
    AllocationFailed(usize),

    /// The object a method is invoked on does not exist.
    #[error("{kind} {handle} used as self does not exist")]
    MissingSelf {
        /// Kind of the self object.
        kind: ObjectKind,
        /// Handle sent by the peer.
        handle: ObjectHandle,
    },

    /// The null id appeared where an object is required.
    #[error("null {0} where an object is required")]
    NullObject(ObjectKind),

    /// An enum, bool or UTF-8 member holds a value outside its domain.
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),

    /// Object table misuse: the id is live, reserved, or too far ahead.
    #[error("cannot allocate {kind} {handle}")]
    BadAllocation {
        /// Kind of the table.
        kind: ObjectKind,
        /// Handle requested by the peer.
        handle: ObjectHandle,
    },

    /// Destroy of an object that cannot be destroyed over the wire.
    #[error("cannot destroy {kind} {id}")]
    BadDestroy {
        /// Kind of the object.
        kind: ObjectKind,
        /// Id sent by the peer.
        id: u32,
    },

    /// An object given to the encoder is not live on this endpoint.
    #[error("{kind} {handle} is not a live object")]
    UnknownObject {
        /// Kind of the object.
        kind: ObjectKind,
        /// Handle that failed to translate.
        handle: ObjectHandle,
    },

    /// A return command contradicts the request it answers.
    #[error("unexpected callback: {0}")]
    UnexpectedCallback(&'static str),

    /// The chunked reassembler saw an impossible sequence.
    #[error("malformed chunk: {0}")]
    Chunk(&'static str),
}
