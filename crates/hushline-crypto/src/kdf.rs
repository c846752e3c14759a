//! HKDF-SHA256 derivations: X3DH shared secret, session bootstrap, root
//! ratchet steps and the backup key.

use std::fmt;

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{
    chain::ChainKey,
    keys::{DhOutput, KEY_SIZE},
};

/// Label for the X3DH shared-secret derivation
const X3DH_LABEL: &[u8] = b"hushlineX3dhV1";

/// Label for splitting the shared secret into root and chain keys
const SESSION_LABEL: &[u8] = b"hushlineSessionV1";

/// Label for DH ratchet root steps
const ROOT_LABEL: &[u8] = b"hushlineRootV1";

/// Label for the recovery-phrase backup key
const BACKUP_LABEL: &[u8] = b"hushlineBackupV1";

/// Curve25519 domain-separation prefix prepended to the X3DH input
const X3DH_PREFIX: [u8; KEY_SIZE] = [0xFF; KEY_SIZE];

fn expand<const N: usize>(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> Zeroizing<[u8; N]> {
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = Zeroizing::new([0u8; N]);
    let Ok(()) = hkdf.expand(info, &mut okm[..]) else {
        unreachable!("requested length is a valid HKDF-SHA256 output length");
    };
    okm
}

fn split(okm: &[u8; 2 * KEY_SIZE]) -> (RootKey, ChainKey) {
    let mut root = [0u8; KEY_SIZE];
    let mut chain = [0u8; KEY_SIZE];
    root.copy_from_slice(&okm[..KEY_SIZE]);
    chain.copy_from_slice(&okm[KEY_SIZE..]);
    let pair = (RootKey(root), ChainKey::new(chain));
    root.zeroize();
    chain.zeroize();
    pair
}

/// X3DH output shared by both parties.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; KEY_SIZE]);

impl SharedSecret {
    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// Root key of a Double Ratchet session.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct RootKey([u8; KEY_SIZE]);

impl RootKey {
    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// One DH ratchet step: mix `dh` into the root and emit a fresh chain.
    pub fn ratchet(&self, dh: &DhOutput) -> (RootKey, ChainKey) {
        let okm = expand::<{ 2 * KEY_SIZE }>(Some(&self.0), dh.as_bytes(), ROOT_LABEL);
        split(&okm)
    }
}

impl fmt::Debug for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RootKey([REDACTED])")
    }
}

/// Combine X3DH agreement outputs into the shared secret.
///
/// Input keying material is `0xFF * 32 || DH1 || DH2 || DH3 [|| DH4]`,
/// salted with 32 zero bytes. Both parties must pass the agreements in the
/// same order.
pub fn derive_x3dh_secret(agreements: &[DhOutput]) -> SharedSecret {
    let mut ikm = Zeroizing::new(Vec::with_capacity(KEY_SIZE * (agreements.len() + 1)));
    ikm.extend_from_slice(&X3DH_PREFIX);
    for agreement in agreements {
        ikm.extend_from_slice(agreement.as_bytes());
    }

    let okm = expand::<KEY_SIZE>(Some(&[0u8; KEY_SIZE]), &ikm, X3DH_LABEL);
    SharedSecret(*okm)
}

/// Split the X3DH shared secret into the initial root key and the first
/// chain key (the initiator's sending chain, the responder's receiving
/// chain).
pub fn derive_session_keys(shared: &SharedSecret) -> (RootKey, ChainKey) {
    let okm = expand::<{ 2 * KEY_SIZE }>(None, shared.as_bytes(), SESSION_LABEL);
    split(&okm)
}

/// Derive the backup encryption key from a recovery-phrase seed.
pub fn derive_backup_key(seed: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    expand::<KEY_SIZE>(None, seed, BACKUP_LABEL)
}
