//! Key types for X25519 agreement and Ed25519 identity signatures.
//!
//! Secret halves zeroize on drop and print redacted. Public halves print a
//! short hex prefix so logs can correlate keys without dumping them.

use std::fmt;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, SeqAccess, Visitor},
};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Size of every public and secret key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

fn short_hex(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

/// X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Wrap raw key bytes.
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", short_hex(&self.0))
    }
}

/// X25519 secret scalar.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    /// Wrap raw scalar bytes. Clamping happens at use.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Derive the matching public key.
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(X25519PublicKey::from(&secret).to_bytes())
    }

    /// X25519 agreement with `public`.
    ///
    /// Rejects low-order peer keys whose output carries no contribution from
    /// our scalar.
    pub fn diffie_hellman(&self, public: &PublicKey) -> Result<DhOutput, CryptoError> {
        let secret = StaticSecret::from(self.0);
        let shared = secret.diffie_hellman(&X25519PublicKey::from(public.0));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(DhOutput(shared.to_bytes()))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

/// X25519 key pair used for signed pre-keys, one-time pre-keys, ephemeral
/// keys and ratchet keys.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Build a key pair from caller-supplied random bytes.
    pub fn from_random(random: [u8; KEY_SIZE]) -> Self {
        Self::from_secret(SecretKey::from_bytes(random))
    }

    /// Build a key pair from an existing secret.
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Public half.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Secret half.
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// X25519 agreement between our secret and `public`.
    pub fn diffie_hellman(&self, public: &PublicKey) -> Result<DhOutput, CryptoError> {
        self.secret.diffie_hellman(public)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Output of one Diffie-Hellman agreement. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DhOutput([u8; KEY_SIZE]);

impl DhOutput {
    /// Raw agreement bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for DhOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DhOutput([REDACTED])")
    }
}

/// Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    /// Wrap raw signature bytes.
    pub const fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw signature bytes.
    pub const fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", short_hex(&self.0))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(SignatureVisitor)
    }
}

struct SignatureVisitor;

impl<'de> Visitor<'de> for SignatureVisitor {
    type Value = Signature;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SIGNATURE_SIZE} signature bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Signature, E> {
        let bytes: [u8; SIGNATURE_SIZE] =
            v.try_into().map_err(|_| E::invalid_length(v.len(), &self))?;
        Ok(Signature(bytes))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Signature, A::Error> {
        let mut bytes = [0u8; SIGNATURE_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = seq.next_element()?.ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(Signature(bytes))
    }
}

/// Public identity key (Ed25519 verifying key).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey([u8; KEY_SIZE]);

impl IdentityKey {
    /// Wrap raw verifying-key bytes.
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw verifying-key bytes.
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Verify `signature` over `message`.
    ///
    /// Uses strict verification: small-order keys and non-canonical
    /// signatures are rejected.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify_strict(message, &signature).map_err(|_| CryptoError::InvalidSignature)
    }

    /// X25519 form of this identity, for the identity legs of X3DH.
    pub fn agreement_key(&self) -> Result<PublicKey, CryptoError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(PublicKey(key.to_montgomery().to_bytes()))
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({}..)", short_hex(&self.0))
    }
}

/// Long-term identity key pair.
///
/// Persisted as its 32-byte Ed25519 seed.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing: SigningKey,
}

impl IdentityKeyPair {
    /// Build the identity from a 32-byte seed of caller-supplied randomness.
    pub fn from_seed(seed: [u8; KEY_SIZE]) -> Self {
        Self { signing: SigningKey::from_bytes(&seed) }
    }

    /// Public identity key.
    pub fn public_key(&self) -> IdentityKey {
        IdentityKey(self.signing.verifying_key().to_bytes())
    }

    /// Sign `message`.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }

    /// X25519 agreement between the identity's scalar and `public`.
    pub fn diffie_hellman(&self, public: &PublicKey) -> Result<DhOutput, CryptoError> {
        SecretKey::from_bytes(self.signing.to_scalar_bytes()).diffie_hellman(public)
    }
}

impl PartialEq for IdentityKeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public_key() == other.public_key()
    }
}

impl Eq for IdentityKeyPair {}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public_key())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl Serialize for IdentityKeyPair {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let seed = zeroize::Zeroizing::new(self.signing.to_bytes());
        seed.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for IdentityKeyPair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut seed = <[u8; KEY_SIZE]>::deserialize(deserializer)?;
        let pair = Self::from_seed(seed);
        seed.zeroize();
        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(fill: u8) -> KeyPair {
        KeyPair::from_random([fill; KEY_SIZE])
    }

    #[test]
    fn diffie_hellman_is_symmetric() {
        let alice = pair(1);
        let bob = pair(2);

        let ab = alice.diffie_hellman(&bob.public_key()).unwrap();
        let ba = bob.diffie_hellman(&alice.public_key()).unwrap();

        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn low_order_public_key_is_rejected() {
        let alice = pair(1);
        let zero = PublicKey::from_bytes([0u8; KEY_SIZE]);

        assert_eq!(alice.diffie_hellman(&zero).unwrap_err(), CryptoError::InvalidPublicKey);
    }

    #[test]
    fn identity_agreement_matches_converted_public_key() {
        let identity = IdentityKeyPair::from_seed([7u8; KEY_SIZE]);
        let other = pair(3);

        let from_identity = identity.diffie_hellman(&other.public_key()).unwrap();
        let agreement_key = identity.public_key().agreement_key().unwrap();
        let from_other = other.diffie_hellman(&agreement_key).unwrap();

        assert_eq!(from_identity.as_bytes(), from_other.as_bytes());
    }

    #[test]
    fn signature_verifies_and_rejects_tamper() {
        let identity = IdentityKeyPair::from_seed([9u8; KEY_SIZE]);
        let signature = identity.sign(b"pre-key bytes");

        identity.public_key().verify(b"pre-key bytes", &signature).unwrap();
        assert_eq!(
            identity.public_key().verify(b"pre-key bytez", &signature).unwrap_err(),
            CryptoError::InvalidSignature
        );

        let mut bytes = *signature.as_bytes();
        bytes[0] ^= 0x01;
        assert!(identity.public_key().verify(b"pre-key bytes", &Signature::from_bytes(bytes)).is_err());
    }

    #[test]
    fn signature_from_other_identity_is_rejected() {
        let alice = IdentityKeyPair::from_seed([1u8; KEY_SIZE]);
        let mallory = IdentityKeyPair::from_seed([2u8; KEY_SIZE]);

        let signature = mallory.sign(b"message");
        assert!(alice.public_key().verify(b"message", &signature).is_err());
    }

    #[test]
    fn identity_serde_preserves_key() {
        let identity = IdentityKeyPair::from_seed([4u8; KEY_SIZE]);
        let mut buf = Vec::new();
        ciborium::into_writer(&identity, &mut buf).unwrap();

        let decoded: IdentityKeyPair = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(decoded.public_key(), identity.public_key());
    }

    #[test]
    fn signature_serde_uses_byte_string() {
        let identity = IdentityKeyPair::from_seed([5u8; KEY_SIZE]);
        let signature = identity.sign(b"x");

        let mut buf = Vec::new();
        ciborium::into_writer(&signature, &mut buf).unwrap();
        // CBOR byte string header for 64 bytes: major type 2, one-byte length
        assert_eq!(&buf[..2], &[0x58, 64]);

        let decoded: Signature = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(decoded, signature);
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let key_pair = pair(0xAA);
        let rendered = format!("{key_pair:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("170, 170"));

        let identity = IdentityKeyPair::from_seed([0xBB; KEY_SIZE]);
        assert!(format!("{identity:?}").contains("REDACTED"));
    }
}
