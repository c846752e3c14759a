//! Group messaging payloads.

use std::fmt;

use hushline_crypto::{KEY_SIZE, NONCE_SIZE};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{errors::Result, from_cbor, to_cbor};

/// A member's sender key, sent to each other member over their pairwise
/// session.
///
/// Carries the chain key in clear, so it must only ever travel inside an
/// encrypted envelope. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SenderKeyDistribution {
    /// Group the key belongs to
    pub group_id: String,
    /// Sender key generation; increases on every rotation
    pub key_id: u32,
    /// Chain index the key is handed over at
    pub iteration: u32,
    /// Chain key at `iteration`
    pub chain_key: [u8; KEY_SIZE],
}

impl SenderKeyDistribution {
    /// Encode as CBOR.
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_cbor(self)
    }

    /// Decode from CBOR.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        from_cbor(bytes)
    }
}

impl fmt::Debug for SenderKeyDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderKeyDistribution")
            .field("group_id", &self.group_id)
            .field("key_id", &self.key_id)
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}

/// Message encrypted once under the sender's chain and fanned out to every
/// member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    /// Target group
    pub group_id: String,
    /// Sender key generation used
    pub key_id: u32,
    /// Chain index of the message key
    pub iteration: u32,
    /// `XChaCha20` nonce
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext including 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
}

impl GroupMessage {
    /// Bytes bound into the AEAD: `len(group_id) || group_id || key_id ||
    /// iteration`, integers big-endian.
    pub fn associated_data(&self) -> Vec<u8> {
        let group = self.group_id.as_bytes();
        let mut ad = Vec::with_capacity(4 + group.len() + 8);
        ad.extend_from_slice(&(group.len() as u32).to_be_bytes());
        ad.extend_from_slice(group);
        ad.extend_from_slice(&self.key_id.to_be_bytes());
        ad.extend_from_slice(&self.iteration.to_be_bytes());
        ad
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
