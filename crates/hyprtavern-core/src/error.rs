//! Wire error types.

use thiserror::Error;

/// Maximum frame size accepted on a tavern connection (1 MiB).
///
/// The bus carries registry metadata and small key-value payloads; anything
/// near this limit is a misbehaving peer.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Errors produced by the wire layer.
#[derive(Debug, Error)]
pub enum WireError {
    /// I/O error on the underlying socket.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame exceeded the maximum allowed size.
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Size declared by the length prefix.
        size: usize,
        /// Maximum frame size allowed.
        max: usize,
    },

    /// A frame's payload was not a valid message.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The peer closed the connection.
    #[error("peer hung up")]
    Closed,

    /// The peer broke the handshake sequence.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A message required a file descriptor that never arrived.
    #[error("expected an attached file descriptor, none was delivered")]
    MissingFd,
}

/// Result alias for wire operations.
pub type WireResult<T> = Result<T, WireError>;
