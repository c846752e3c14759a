//! Protocol errors.

use thiserror::Error;

/// Result type for wire-format operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors from encoding or parsing wire messages
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer shorter than the fixed layout requires
    #[error("message too short: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Version byte not understood by this build
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// Encoded message exceeds [`crate::MAX_MESSAGE_SIZE`]
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Actual size
        size: usize,
        /// Limit
        max: usize,
    },

    /// CBOR serialization failed
    #[error("CBOR encode failed: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed
    #[error("CBOR decode failed: {0}")]
    CborDecode(String),
}
