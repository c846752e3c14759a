//! Ratchet message header with a fixed binary layout.
//!
//! The header travels in clear and its encoded bytes are bound into the
//! AEAD associated data, so the encoding must be canonical: one header, one
//! byte string.

use hushline_crypto::{KEY_SIZE, PublicKey};
use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Header of one Double Ratchet message.
///
/// Layout (Big Endian, 41 bytes):
///
/// ```text
/// [version:1][ratchet_key:32][counter:4][previous_counter:4]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current ratchet public key
    pub ratchet_key: PublicKey,
    /// Index of this message in the sender's current sending chain
    pub counter: u32,
    /// Length of the sender's previous sending chain
    pub previous_counter: u32,
}

impl MessageHeader {
    /// Size of the serialized header (41 bytes)
    pub const SIZE: usize = 1 + KEY_SIZE + 4 + 4;

    /// Current header version
    pub const VERSION: u8 = 0x01;

    /// Serialize to the canonical binary layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = Self::VERSION;
        bytes[1..33].copy_from_slice(self.ratchet_key.as_bytes());
        bytes[33..37].copy_from_slice(&self.counter.to_be_bytes());
        bytes[37..41].copy_from_slice(&self.previous_counter.to_be_bytes());
        bytes
    }

    /// Parse from the canonical binary layout.
    ///
    /// Trailing bytes are rejected so that exactly one byte string maps to
    /// each header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(ProtocolError::Truncated { expected: Self::SIZE, actual: bytes.len() });
        }

        if bytes[0] != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(bytes[0]));
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes[1..33]);
        let mut counter = [0u8; 4];
        counter.copy_from_slice(&bytes[33..37]);
        let mut previous = [0u8; 4];
        previous.copy_from_slice(&bytes[37..41]);

        Ok(Self {
            ratchet_key: PublicKey::from_bytes(key),
            counter: u32::from_be_bytes(counter),
            previous_counter: u32::from_be_bytes(previous),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> MessageHeader {
        MessageHeader {
            ratchet_key: PublicKey::from_bytes([0xAA; KEY_SIZE]),
            counter: 0x0102_0304,
            previous_counter: 0x0506_0708,
        }
    }

    #[test]
    fn layout_is_big_endian() {
        let bytes = header().to_bytes();

        assert_eq!(bytes.len(), MessageHeader::SIZE);
        assert_eq!(bytes[0], MessageHeader::VERSION);
        assert_eq!(&bytes[1..33], &[0xAA; KEY_SIZE]);
        assert_eq!(&bytes[33..37], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[37..41], &[0x05, 0x06, 0x07, 0x08]);
    }

    #[test]
    fn parse_recovers_header() {
        let parsed = MessageHeader::from_bytes(&header().to_bytes()).unwrap();
        assert_eq!(parsed, header());
    }

    #[test]
    fn short_buffer_is_rejected() {
        let bytes = header().to_bytes();
        assert_eq!(
            MessageHeader::from_bytes(&bytes[..40]),
            Err(ProtocolError::Truncated { expected: 41, actual: 40 })
        );
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = header().to_bytes().to_vec();
        bytes.push(0);
        assert!(matches!(MessageHeader::from_bytes(&bytes), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = header().to_bytes();
        bytes[0] = 0xFF;
        assert_eq!(MessageHeader::from_bytes(&bytes), Err(ProtocolError::UnsupportedVersion(0xFF)));
    }
}
