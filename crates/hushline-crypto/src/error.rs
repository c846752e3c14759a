//! Errors raised by the primitive layer.

use thiserror::Error;

/// Errors from key handling, chain ratchets and AEAD.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Public key bytes do not decode to a usable curve point, or the
    /// agreement produced the all-zero output.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Signature did not verify against the claimed identity key.
    #[error("invalid signature")]
    InvalidSignature,

    /// AEAD tag check failed (wrong key, tampered data, or wrong context).
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Chain index would exceed `u32::MAX`.
    #[error("chain index overflow at {current}")]
    ChainIndexOverflow {
        /// Index at which the overflow was detected
        current: u32,
    },

    /// Requested index is below the chain position; its key is gone.
    #[error("chain index {requested} already consumed (chain at {current})")]
    ChainIndexConsumed {
        /// Current chain index
        current: u32,
        /// Requested index
        requested: u32,
    },

    /// Reaching the requested index would derive more than `max_skip` keys.
    #[error("chain index {requested} too far ahead of {current} (max skip {max_skip})")]
    SkipLimitExceeded {
        /// Current chain index
        current: u32,
        /// Requested index
        requested: u32,
        /// Configured skip bound
        max_skip: u32,
    },
}

impl CryptoError {
    /// Whether the error points at a forged or corrupted input rather than
    /// local state.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::InvalidSignature | Self::AuthenticationFailed)
    }
}
