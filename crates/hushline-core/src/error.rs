//! Error types for the Hushline engine.
//!
//! Every public operation returns [`EngineError`]. Decryption failures carry
//! a [`DecryptFailure`] for local diagnostics; callers should surface them to
//! users as a single undecryptable-message state.

use std::fmt;

use hushline_crypto::CryptoError;
use hushline_proto::ProtocolError;
use thiserror::Error;

use crate::{address::PeerAddress, store::StorageError};

/// Why a message failed to decrypt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptFailure {
    /// AEAD tag check failed
    Authentication,
    /// Message key already consumed (replay or duplicate delivery)
    Duplicate,
    /// Counter beyond the skip bound
    TooFarAhead,
    /// Cached key for this message exceeded its retention age
    SkippedKeyExpired,
    /// Header carried a key that yields no valid agreement
    MalformedKey,
    /// Session has no receiving chain for this header
    NoReceivingChain,
}

impl fmt::Display for DecryptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Authentication => "authentication failed",
            Self::Duplicate => "message key already used",
            Self::TooFarAhead => "message too far ahead",
            Self::SkippedKeyExpired => "skipped message key expired",
            Self::MalformedKey => "malformed ratchet key",
            Self::NoReceivingChain => "no receiving chain",
        };
        f.write_str(text)
    }
}

/// Errors returned by engine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Entropy source failed or produced unusable key material
    #[error("key generation failed: {reason}")]
    KeyGenerationFailed {
        /// What failed
        reason: String,
    },

    /// A signed pre-key or backup signature did not verify
    #[error("signature verification failed")]
    SignatureVerificationFailed,

    /// X3DH could not complete
    #[error("session establishment failed: {reason}")]
    SessionEstablishmentFailed {
        /// What failed
        reason: String,
    },

    /// Message could not be decrypted; session state is unchanged
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Local diagnostic
        reason: DecryptFailure,
    },

    /// Repeated out-of-window messages; the session needs re-establishing
    #[error("ratchet desynchronized with {peer}")]
    RatchetDesynchronized {
        /// Peer whose session is out of step
        peer: PeerAddress,
    },

    /// Key store failed
    #[error("storage failed: {0}")]
    StorageFailed(#[from] StorageError),

    /// No identity key has been generated on this device
    #[error("identity not initialized")]
    IdentityNotInitialized,

    /// No session exists with the peer
    #[error("no session with {peer}")]
    NoSession {
        /// Requested peer
        peer: PeerAddress,
    },

    /// Session was closed and its keys destroyed
    #[error("session closed")]
    SessionClosed,

    /// Session record lacks state the operation needs
    #[error("invalid session state: {reason}")]
    InvalidSessionState {
        /// Missing state
        reason: &'static str,
    },

    /// No usable sender key for a group message
    #[error("unknown sender key {key_id} in group {group_id}")]
    UnknownSenderKey {
        /// Group of the message
        group_id: String,
        /// Sender key generation requested
        key_id: u32,
    },

    /// Backup could not be created or restored
    #[error("backup failed: {reason}")]
    BackupFailed {
        /// What failed
        reason: String,
    },

    /// Configuration values are inconsistent
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Offending setting
        reason: String,
    },

    /// Wire data could not be encoded or decoded
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl EngineError {
    /// Shorthand for a decryption failure.
    pub fn decryption(reason: DecryptFailure) -> Self {
        Self::DecryptionFailed { reason }
    }

    /// Returns true if the same call may succeed when retried unchanged.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::StorageFailed(err) => err.is_transient(),
            Self::KeyGenerationFailed { .. } | Self::SessionEstablishmentFailed { .. } => true,
            _ => false,
        }
    }

    /// Returns true if the caller must establish a fresh session.
    pub fn requires_rekey(&self) -> bool {
        matches!(
            self,
            Self::RatchetDesynchronized { .. }
                | Self::NoSession { .. }
                | Self::SessionClosed
                | Self::InvalidSessionState { .. }
        )
    }
}

impl From<CryptoError> for EngineError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidSignature => Self::SignatureVerificationFailed,
            CryptoError::AuthenticationFailed => Self::decryption(DecryptFailure::Authentication),
            CryptoError::InvalidPublicKey => Self::decryption(DecryptFailure::MalformedKey),
            CryptoError::ChainIndexConsumed { .. } => Self::decryption(DecryptFailure::Duplicate),
            CryptoError::SkipLimitExceeded { .. } => Self::decryption(DecryptFailure::TooFarAhead),
            CryptoError::ChainIndexOverflow { .. } => Self::SessionClosed,
        }
    }
}
