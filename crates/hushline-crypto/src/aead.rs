//! Message sealing using `XChaCha20-Poly1305`
//!
//! All functions are pure: random nonce bytes come from the caller.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};

use crate::{error::CryptoError, keys::KEY_SIZE};

/// `XChaCha20` nonce size (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Size of the random part of the nonce (20 bytes)
pub const NONCE_RANDOM_SIZE: usize = 20;

/// Poly1305 tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Build a 24-byte nonce for `XChaCha20`.
///
/// Structure:
/// - bytes 0-3: message index (big-endian)
/// - bytes 4-23: random suffix (caller-provided)
pub fn build_nonce(index: u32, random_suffix: [u8; NONCE_RANDOM_SIZE]) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[0..4].copy_from_slice(&index.to_be_bytes());
    nonce[4..].copy_from_slice(&random_suffix);
    nonce
}

/// Encrypt `plaintext` under `key`, authenticating `associated_data`.
///
/// Returns ciphertext with the 16-byte tag appended.
pub fn seal(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let payload = Payload { msg: plaintext, aad: associated_data };

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(nonce), payload) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };
    ciphertext
}

/// Decrypt and authenticate `ciphertext`.
///
/// Any mismatch in key, nonce, ciphertext or associated data fails with
/// [`CryptoError::AuthenticationFailed`].
pub fn open(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::AuthenticationFailed);
    }

    let cipher = XChaCha20Poly1305::new(key.into());
    let payload = Payload { msg: ciphertext, aad: associated_data };

    cipher
        .decrypt(XNonce::from_slice(nonce), payload)
        .map_err(|_| CryptoError::AuthenticationFailed)
}
