//! Encrypted backup and recovery.
//!
//! A backup holds the identity key pair, every signed pre-key, every session
//! and every sender key record. One-time pre-keys are left out: after a
//! restore the device publishes a fresh batch.
//!
//! # Format
//!
//! ```text
//! "HLBK" | version (1) | nonce (24) | XChaCha20-Poly1305(CBOR(SignedBundle))
//! ```
//!
//! The key is derived from a 24-word recovery phrase. Inside, the bundle is
//! signed by the identity it carries; restore checks that signature and every
//! signed pre-key signature before writing anything.

#![allow(clippy::disallowed_types, reason = "In-memory backup storage for tests")]

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use bip39::Mnemonic;
use hushline_crypto::{
    IdentityKey, IdentityKeyPair, NONCE_SIZE, Signature, derive_backup_key, open, seal,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::{
    address::PeerAddress,
    env::Environment,
    error::EngineError,
    group::SenderKeyRecord,
    prekeys::{SignedPreKey, verify_signed_pre_key},
    session::Session,
    store::KeyStore,
};

const MAGIC: &[u8; 4] = b"HLBK";
const FORMAT_VERSION: u8 = 1;
const HEADER_SIZE: usize = MAGIC.len() + 1 + NONCE_SIZE;
const SIGNATURE_CONTEXT: &[u8] = b"hushline-backup-v1";
const PHRASE_WORDS: usize = 24;

fn backup_failed(reason: impl Into<String>) -> EngineError {
    EngineError::BackupFailed { reason: reason.into() }
}

/// 24-word BIP39 recovery phrase over 256 bits of entropy.
#[derive(Clone)]
pub struct RecoveryPhrase {
    mnemonic: Mnemonic,
}

impl RecoveryPhrase {
    /// Fresh phrase from the environment's entropy source.
    pub fn generate<E: Environment>(env: &E) -> Result<Self, EngineError> {
        let entropy = Zeroizing::new(env.random_array::<32>()?);
        let mnemonic = Mnemonic::from_entropy(entropy.as_slice())
            .map_err(|e| EngineError::KeyGenerationFailed { reason: e.to_string() })?;
        Ok(Self { mnemonic })
    }

    /// Parse a phrase typed back by the user.
    ///
    /// Case and surrounding whitespace are ignored. The checksum word must
    /// match.
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        let normalized = Zeroizing::new(
            text.split_whitespace().map(str::to_lowercase).collect::<Vec<_>>().join(" "),
        );
        let mnemonic = Mnemonic::parse_normalized(&normalized)
            .map_err(|e| backup_failed(format!("invalid recovery phrase: {e}")))?;
        if mnemonic.word_count() != PHRASE_WORDS {
            return Err(backup_failed(format!(
                "recovery phrase has {} words, expected {PHRASE_WORDS}",
                mnemonic.word_count()
            )));
        }
        Ok(Self { mnemonic })
    }

    /// The words, space separated. Show this to the user once.
    pub fn phrase(&self) -> Zeroizing<String> {
        Zeroizing::new(self.mnemonic.to_string())
    }

    fn backup_key(&self) -> Zeroizing<[u8; 32]> {
        let seed = Zeroizing::new(self.mnemonic.to_seed_normalized(""));
        derive_backup_key(seed.as_slice())
    }
}

impl fmt::Debug for RecoveryPhrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoveryPhrase([REDACTED])")
    }
}

#[derive(Serialize, Deserialize)]
struct BackupBundle {
    identity: IdentityKeyPair,
    signed_pre_keys: Vec<SignedPreKey>,
    sessions: Vec<(PeerAddress, Session)>,
    sender_keys: Vec<SenderKeyRecord>,
    created_at: u64,
}

#[derive(Serialize, Deserialize)]
struct SignedBundle {
    payload: Vec<u8>,
    signature: Signature,
}

/// Magic and version, bound to the ciphertext.
fn associated_data() -> [u8; 5] {
    let mut data = [FORMAT_VERSION; 5];
    data[..MAGIC.len()].copy_from_slice(MAGIC);
    data
}

fn signing_input(payload: &[u8]) -> Zeroizing<Vec<u8>> {
    Zeroizing::new([SIGNATURE_CONTEXT, payload].concat())
}

fn to_cbor<T: Serialize>(value: &T) -> Result<Zeroizing<Vec<u8>>, EngineError> {
    let mut bytes = Zeroizing::new(Vec::new());
    ciborium::into_writer(value, &mut *bytes).map_err(|e| backup_failed(e.to_string()))?;
    Ok(bytes)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EngineError> {
    ciborium::from_reader(bytes).map_err(|e| backup_failed(format!("malformed bundle: {e}")))
}

/// What [`restore_backup`] wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Restored identity
    pub identity: IdentityKey,
    /// Signed pre-keys written
    pub signed_pre_keys: usize,
    /// Sessions written
    pub sessions: usize,
    /// Sender key records written
    pub sender_keys: usize,
}

/// Serialize, sign and encrypt everything in `store` except one-time
/// pre-keys.
pub fn export_backup<S: KeyStore, E: Environment>(
    store: &S,
    env: &E,
    phrase: &RecoveryPhrase,
) -> Result<Vec<u8>, EngineError> {
    let identity = store.load_identity()?.ok_or(EngineError::IdentityNotInitialized)?;

    let mut sessions = Vec::new();
    for peer in store.list_sessions()? {
        if let Some(session) = store.load_session(&peer)? {
            sessions.push((peer, session));
        }
    }

    let bundle = BackupBundle {
        signed_pre_keys: store.list_signed_pre_keys()?,
        sessions,
        sender_keys: store.list_sender_keys()?,
        created_at: env.now_secs(),
        identity: identity.clone(),
    };
    let payload = to_cbor(&bundle)?;
    let signature = identity.sign(&signing_input(&payload));
    let signed = to_cbor(&SignedBundle { payload: payload.to_vec(), signature })?;

    let nonce: [u8; NONCE_SIZE] = env.random_array()?;
    let ciphertext = seal(&phrase.backup_key(), &nonce, &signed, &associated_data());

    let mut blob = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    blob.extend_from_slice(MAGIC);
    blob.push(FORMAT_VERSION);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);

    info!(
        sessions = bundle.sessions.len(),
        sender_keys = bundle.sender_keys.len(),
        bytes = blob.len(),
        "exported backup"
    );
    Ok(blob)
}

/// Decrypt `blob`, verify it and write its contents into `store`.
///
/// Nothing is written unless every signature verifies. A store that already
/// holds a different identity is left untouched.
pub fn restore_backup<S: KeyStore>(
    store: &S,
    phrase: &RecoveryPhrase,
    blob: &[u8],
) -> Result<RestoreSummary, EngineError> {
    if blob.len() < HEADER_SIZE || &blob[..MAGIC.len()] != MAGIC {
        return Err(backup_failed("not a backup"));
    }
    let version = blob[MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(backup_failed(format!("unsupported backup version {version}")));
    }
    let (header, ciphertext) = blob.split_at(HEADER_SIZE);
    let Some((_, nonce)) = header.split_last_chunk::<NONCE_SIZE>() else {
        return Err(backup_failed("not a backup"));
    };

    let signed = Zeroizing::new(
        open(&phrase.backup_key(), nonce, ciphertext, &associated_data())
            .map_err(|_| backup_failed("wrong recovery phrase or corrupted backup"))?,
    );
    let signed: SignedBundle = from_cbor(&signed)?;
    let signed_payload = Zeroizing::new(signed.payload);
    let bundle: BackupBundle = from_cbor(&signed_payload)?;

    let identity_key = bundle.identity.public_key();
    identity_key.verify(&signing_input(&signed_payload), &signed.signature).map_err(|_| {
        warn!("backup signature invalid");
        EngineError::SignatureVerificationFailed
    })?;
    for key in &bundle.signed_pre_keys {
        verify_signed_pre_key(&identity_key, &key.public())?;
    }

    if let Some(existing) = store.load_identity()?
        && existing != bundle.identity
    {
        return Err(backup_failed("store holds a different identity"));
    }
    if store.initialize_identity(&bundle.identity)? != bundle.identity {
        return Err(backup_failed("store holds a different identity"));
    }

    for key in &bundle.signed_pre_keys {
        store.store_signed_pre_key(key)?;
    }
    for (peer, session) in &bundle.sessions {
        store.store_session(peer, session)?;
    }
    for record in &bundle.sender_keys {
        store.store_sender_key(record)?;
    }

    let summary = RestoreSummary {
        identity: identity_key,
        signed_pre_keys: bundle.signed_pre_keys.len(),
        sessions: bundle.sessions.len(),
        sender_keys: bundle.sender_keys.len(),
    };
    info!(
        sessions = summary.sessions,
        sender_keys = summary.sender_keys,
        created_at = bundle.created_at,
        "restored backup"
    );
    Ok(summary)
}

/// External storage for encrypted backup blobs.
///
/// Only ever sees ciphertext.
pub trait BackupStorage: Send + Sync {
    /// Store `blob` under `backup_id`, replacing any previous blob.
    fn put(&self, backup_id: &str, blob: &[u8]) -> Result<(), EngineError>;

    /// Blob stored under `backup_id`.
    fn get(&self, backup_id: &str) -> Result<Option<Vec<u8>>, EngineError>;
}

/// In-memory [`BackupStorage`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackupStorage {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBackupStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackupStorage for MemoryBackupStorage {
    fn put(&self, backup_id: &str, blob: &[u8]) -> Result<(), EngineError> {
        #[allow(clippy::expect_used)]
        let mut blobs = self.blobs.lock().expect("Mutex poisoned");
        blobs.insert(backup_id.to_string(), blob.to_vec());
        Ok(())
    }

    fn get(&self, backup_id: &str) -> Result<Option<Vec<u8>>, EngineError> {
        #[allow(clippy::expect_used)]
        let blobs = self.blobs.lock().expect("Mutex poisoned");
        Ok(blobs.get(backup_id).cloned())
    }
}
