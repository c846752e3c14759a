//! Hushline Cryptographic Primitives
//!
//! Building blocks for pairwise and group end-to-end encryption. Every
//! function here is pure: callers supply the random bytes, which keeps the
//! higher layers deterministic under simulation.
//!
//! # Key Lifecycle
//!
//! ```text
//! X3DH agreements (DH1..DH4)
//!        │
//!        ▼
//! HKDF → shared secret → root key + first chain key
//!        │
//!        ▼
//! DH ratchet (root KDF) → fresh chain keys per turn
//!        │
//!        ▼
//! Chain ratchet (HMAC) → one-time message keys
//!        │
//!        ▼
//! AEAD Encryption → Ciphertext
//! ```
//!
//! Chain keys are overwritten as they advance and message keys are zeroized
//! on drop, so state captured at step N cannot recover any key from a step
//! below N.
//!
//! # Identity Keys
//!
//! The long-term identity is an Ed25519 key pair. Its X25519 form is used
//! for the identity legs of X3DH, so a single 32-byte public key serves for
//! both signing and agreement.

#![forbid(unsafe_code)]

pub mod aead;
pub mod chain;
pub mod error;
pub mod kdf;
pub mod keys;

pub use aead::{NONCE_RANDOM_SIZE, NONCE_SIZE, TAG_SIZE, build_nonce, open, seal};
pub use chain::{ChainKey, MAX_SKIP, MessageKey};
pub use error::CryptoError;
pub use kdf::{RootKey, SharedSecret, derive_backup_key, derive_session_keys, derive_x3dh_secret};
pub use keys::{
    DhOutput, IdentityKey, IdentityKeyPair, KEY_SIZE, KeyPair, PublicKey, SIGNATURE_SIZE,
    SecretKey, Signature,
};
