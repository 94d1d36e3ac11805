//! Error types for wire-format parsing and encoding.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while parsing or encoding frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer is too short to contain the expected structure.
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Number of bytes the structure requires
        expected: usize,
        /// Number of bytes available
        actual: usize,
    },

    /// Header declared an unsupported protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Header `total_size` is not a multiple of 8 or smaller than the
    /// fixed envelope.
    #[error("invalid frame size: {0}")]
    InvalidSize(u32),

    /// Trailer sentinel did not match the protocol constant.
    #[error("frame trailer sentinel mismatch")]
    SentinelMismatch,

    /// Payload exceeds the single-frame budget.
    #[error("payload too large: {size} bytes exceeds {max}")]
    PayloadTooLarge {
        /// Actual payload size
        size: usize,
        /// Maximum allowed
        max: usize,
    },

    /// A frame body did not match the layout its sub-type requires.
    #[error("malformed {0} frame body")]
    MalformedBody(&'static str),
}
