//! Error types for gpuwire endpoints.

use gpuwire_proto::WireError;

/// Alias for `Result<T, gpuwire::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by client and server operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The peer violated the protocol, or a local record could not be
    /// encoded. After a protocol violation the connection is dead.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// The connection was lost earlier; nothing more can be sent.
    #[error("connection lost")]
    Disconnected,

    /// A configuration file could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// An I/O error from a transport or trace file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
