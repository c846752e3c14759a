//! Symmetric chain ratchet for forward-secure message key derivation
//!
//! Used for the sending and receiving chains of a pairwise session and for
//! group sender keys.
//!
//! # Security Properties
//!
//! - Forward Secrecy: old chain keys are overwritten when advancing
//! - Key Uniqueness: each index produces a unique message key
//! - Determinism: the same chain key always produces the same sequence

use std::fmt;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{error::CryptoError, keys::KEY_SIZE};

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = b"chain";

/// Label for deriving a message key
const MESSAGE_LABEL: &[u8] = b"message";

/// Default bound on keys derived ahead of the chain position in one step.
pub const MAX_SKIP: u32 = 1000;

/// A message key derived from a chain.
///
/// Used for exactly one encryption or decryption.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct MessageKey {
    /// 32-byte symmetric key for XChaCha20-Poly1305
    key: [u8; KEY_SIZE],
    /// Chain index this key was derived at
    index: u32,
}

impl MessageKey {
    /// 32-byte symmetric key for XChaCha20-Poly1305 AEAD.
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Chain index this key was derived at.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageKey").field("index", &self.index).finish_non_exhaustive()
    }
}

/// Forward-secure chain key.
///
/// Each [`advance()`](Self::advance) call:
/// 1. Derives a message key from the current chain key
/// 2. Derives the next chain key
/// 3. Overwrites the old chain key
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct ChainKey {
    /// Current chain key (32 bytes)
    key: [u8; KEY_SIZE],
    /// Index of the next message key this chain will produce
    index: u32,
}

impl ChainKey {
    /// Start a chain at index 0.
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self { key, index: 0 }
    }

    /// Resume a chain at a known index.
    ///
    /// Used when a sender key is distributed mid-chain.
    pub fn with_index(key: [u8; KEY_SIZE], index: u32) -> Self {
        Self { key, index }
    }

    /// Index of the next message key.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Raw chain key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Advance the chain and return the message key for the current index.
    pub fn advance(&mut self) -> Result<MessageKey, CryptoError> {
        if self.index == u32::MAX {
            return Err(CryptoError::ChainIndexOverflow { current: self.index });
        }

        let message_key = self.derive(MESSAGE_LABEL);
        let next_chain_key = self.derive(CHAIN_LABEL);

        // Overwrite the old chain key for forward secrecy
        self.key.zeroize();
        self.key = next_chain_key;

        let index = self.index;
        self.index += 1;

        Ok(MessageKey { key: message_key, index })
    }

    /// Advance to `target`, returning the keys for every index passed over.
    ///
    /// After a successful call the chain sits at `target`, so the next
    /// [`advance()`](Self::advance) yields the key for `target` itself. The
    /// caller caches the returned keys for out-of-order delivery.
    pub fn skip_to(&mut self, target: u32, max_skip: u32) -> Result<Vec<MessageKey>, CryptoError> {
        if target < self.index {
            return Err(CryptoError::ChainIndexConsumed { current: self.index, requested: target });
        }

        let skip_count = target - self.index;
        if skip_count > max_skip {
            return Err(CryptoError::SkipLimitExceeded {
                current: self.index,
                requested: target,
                max_skip,
            });
        }

        let mut skipped = Vec::with_capacity(skip_count as usize);
        while self.index < target {
            skipped.push(self.advance()?);
        }
        Ok(skipped)
    }

    fn derive(&self, label: &[u8]) -> [u8; KEY_SIZE] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(label);
        let result = mac.finalize().into_bytes();

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&result);
        key
    }
}

impl fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainKey").field("index", &self.index).finish_non_exhaustive()
    }
}
