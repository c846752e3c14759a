//! Pairwise message envelopes.

use hushline_crypto::{IdentityKey, NONCE_SIZE, PublicKey, TAG_SIZE};
use serde::{Deserialize, Serialize};

use crate::{errors::Result, extension::Extension, from_cbor, header::MessageHeader, to_cbor};

/// Data the responder needs to complete X3DH.
///
/// Attached to every message the initiator sends until the responder's
/// first reply arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialMessage {
    /// Initiator's identity key
    pub identity_key: IdentityKey,
    /// Initiator's ephemeral key (also its first ratchet key)
    pub ephemeral_key: PublicKey,
    /// Which of the responder's signed pre-keys was used
    pub signed_pre_key_id: u32,
    /// Which one-time pre-key was used, if the bundle carried one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key_id: Option<u32>,
    /// Optional extensions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<Extension>,
}

/// One encrypted pairwise message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    /// Clear header, authenticated as associated data
    pub header: MessageHeader,
    /// `XChaCha20` nonce
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext including 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    /// Plaintext length (ciphertext length minus authentication tag).
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(TAG_SIZE)
    }
}

/// Pairwise message as carried by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// Message from an initiator whose session is not yet acknowledged
    PreKey {
        /// X3DH parameters for the responder
        initial: InitialMessage,
        /// The encrypted message itself
        message: RatchetMessage,
    },
    /// Message on an established session
    Message(RatchetMessage),
}

impl Envelope {
    /// The encrypted message regardless of variant.
    pub fn message(&self) -> &RatchetMessage {
        match self {
            Self::PreKey { message, .. } | Self::Message(message) => message,
        }
    }

    /// X3DH parameters, when present.
    pub fn initial(&self) -> Option<&InitialMessage> {
        match self {
            Self::PreKey { initial, .. } => Some(initial),
            Self::Message(_) => None,
        }
    }

    /// Encode as CBOR.
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_cbor(self)
    }

    /// Decode from CBOR.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        from_cbor(bytes)
    }
}
