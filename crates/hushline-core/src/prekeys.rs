//! Signed and one-time pre-keys.
//!
//! A device publishes one signed pre-key (rotated on a schedule, kept for a
//! grace period after rotation) and a pool of one-time pre-keys (each
//! consumed by exactly one incoming session, then erased).

use std::fmt;

use hushline_crypto::{IdentityKey, IdentityKeyPair, KeyPair, PublicKey, SecretKey, Signature};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::{MAX_ONE_TIME_UPLOAD, PreKeyPolicy},
    env::Environment,
    error::EngineError,
    store::KeyStore,
};

/// Public half of a signed pre-key as published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    /// Key identifier
    pub key_id: u32,
    /// X25519 public key
    pub public_key: PublicKey,
    /// Identity signature over `public_key`
    pub signature: Signature,
}

/// Public half of a one-time pre-key as published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    /// Key identifier
    pub key_id: u32,
    /// X25519 public key
    pub public_key: PublicKey,
}

/// Signed pre-key with its private half.
#[derive(Clone, Serialize, Deserialize)]
pub struct SignedPreKey {
    key_id: u32,
    key_pair: KeyPair,
    signature: Signature,
    created_at: u64,
    superseded_at: Option<u64>,
}

impl SignedPreKey {
    /// Generate and sign a pre-key from caller-supplied randomness.
    pub fn generate(
        identity: &IdentityKeyPair,
        key_id: u32,
        random: [u8; 32],
        created_at: u64,
    ) -> Self {
        let key_pair = KeyPair::from_random(random);
        let signature = identity.sign(key_pair.public_key().as_bytes());
        Self { key_id, key_pair, signature, created_at, superseded_at: None }
    }

    /// Key identifier.
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    /// Key pair.
    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    /// Identity signature over the public key.
    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// Creation time.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Time a newer key replaced this one, if any.
    pub fn superseded_at(&self) -> Option<u64> {
        self.superseded_at
    }

    /// Mark replaced by a newer key.
    pub fn supersede(&mut self, now: u64) {
        self.superseded_at.get_or_insert(now);
    }

    /// Whether the grace window after supersession has closed.
    pub fn is_expired(&self, now: u64, policy: &PreKeyPolicy) -> bool {
        self.superseded_at
            .is_some_and(|at| now.saturating_sub(at) >= policy.grace_period.as_secs())
    }

    /// Published form.
    pub fn public(&self) -> SignedPreKeyPublic {
        SignedPreKeyPublic {
            key_id: self.key_id,
            public_key: self.key_pair.public_key(),
            signature: self.signature,
        }
    }
}

impl fmt::Debug for SignedPreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedPreKey")
            .field("key_id", &self.key_id)
            .field("public", &self.key_pair.public_key())
            .field("created_at", &self.created_at)
            .field("superseded_at", &self.superseded_at)
            .finish_non_exhaustive()
    }
}

/// One-time pre-key. The private half is erased once consumed.
#[derive(Clone, Serialize, Deserialize)]
pub struct OneTimePreKey {
    key_id: u32,
    public_key: PublicKey,
    secret: Option<SecretKey>,
    created_at: u64,
}

impl OneTimePreKey {
    /// Generate from caller-supplied randomness.
    pub fn generate(key_id: u32, random: [u8; 32], created_at: u64) -> Self {
        let key_pair = KeyPair::from_random(random);
        Self {
            key_id,
            public_key: key_pair.public_key(),
            secret: Some(key_pair.secret_key().clone()),
            created_at,
        }
    }

    /// Key identifier.
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    /// Public key.
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Creation time.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Whether an incoming session has consumed this key.
    pub fn is_used(&self) -> bool {
        self.secret.is_none()
    }

    /// Key pair, unless consumed.
    pub fn key_pair(&self) -> Option<KeyPair> {
        self.secret.clone().map(KeyPair::from_secret)
    }

    /// Mark consumed and erase the private half.
    pub fn consume(&mut self) {
        self.secret = None;
    }

    /// Published form.
    pub fn public(&self) -> OneTimePreKeyPublic {
        OneTimePreKeyPublic { key_id: self.key_id, public_key: self.public_key }
    }
}

impl fmt::Debug for OneTimePreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneTimePreKey")
            .field("key_id", &self.key_id)
            .field("public", &self.public_key)
            .field("used", &self.is_used())
            .finish_non_exhaustive()
    }
}

/// What an initiator fetches from the key directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Responder's identity key
    pub identity_key: IdentityKey,
    /// Responder's current signed pre-key
    pub signed_pre_key: SignedPreKeyPublic,
    /// One unused one-time pre-key, if any remained
    pub one_time_pre_key: Option<OneTimePreKeyPublic>,
}

impl PreKeyBundle {
    /// Check the signed pre-key signature against the bundle identity.
    pub fn verify(&self) -> Result<(), EngineError> {
        verify_signed_pre_key(&self.identity_key, &self.signed_pre_key)
    }
}

/// What a device uploads to the key directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyUpload {
    /// Device identity key
    pub identity_key: IdentityKey,
    /// Current signed pre-key
    pub signed_pre_key: SignedPreKeyPublic,
    /// One-time pre-keys to add to the pool
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
}

/// Verify a signed pre-key signature against `identity`.
pub fn verify_signed_pre_key(
    identity: &IdentityKey,
    signed_pre_key: &SignedPreKeyPublic,
) -> Result<(), EngineError> {
    identity
        .verify(signed_pre_key.public_key.as_bytes(), &signed_pre_key.signature)
        .map_err(|_| EngineError::SignatureVerificationFailed)
}

/// Outcome of one [`PreKeyManager::run_maintenance`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Signed pre-key generated by rotation, if rotation was due
    pub rotated_signed_pre_key: Option<u32>,
    /// Superseded signed pre-keys deleted after their grace window
    pub expired_signed_pre_keys: Vec<u32>,
    /// One-time pre-keys generated by replenishment
    pub new_one_time_pre_keys: Vec<OneTimePreKeyPublic>,
}

impl MaintenanceReport {
    /// Whether anything must be re-published to the key directory.
    pub fn needs_publish(&self) -> bool {
        self.rotated_signed_pre_key.is_some() || !self.new_one_time_pre_keys.is_empty()
    }
}

/// Generates, rotates and replenishes pre-keys in a [`KeyStore`].
#[derive(Clone)]
pub struct PreKeyManager<S: KeyStore, E: Environment> {
    store: S,
    env: E,
    policy: PreKeyPolicy,
}

impl<S: KeyStore, E: Environment> PreKeyManager<S, E> {
    /// Create a manager over `store`.
    pub fn new(store: S, env: E, policy: PreKeyPolicy) -> Self {
        Self { store, env, policy }
    }

    /// Generate, sign and store a new signed pre-key.
    ///
    /// Key ids increase monotonically from 1.
    pub fn generate_signed_pre_key(
        &self,
        identity: &IdentityKeyPair,
    ) -> Result<SignedPreKey, EngineError> {
        let next_id = self
            .store
            .list_signed_pre_keys()?
            .iter()
            .map(SignedPreKey::key_id)
            .max()
            .map_or(1, |id| id + 1);

        let key = SignedPreKey::generate(
            identity,
            next_id,
            self.env.random_array()?,
            self.env.now_secs(),
        );
        self.store.store_signed_pre_key(&key)?;

        info!(key_id = next_id, "generated signed pre-key");
        Ok(key)
    }

    /// Generate and store `count` one-time pre-keys.
    ///
    /// Ids continue after the highest id ever stored, so consumed ids are
    /// never reissued.
    pub fn generate_one_time_pre_keys(
        &self,
        count: u32,
    ) -> Result<Vec<OneTimePreKey>, EngineError> {
        let first_id = self
            .store
            .list_one_time_pre_keys()?
            .iter()
            .map(OneTimePreKey::key_id)
            .max()
            .map_or(1, |id| id + 1);

        let now = self.env.now_secs();
        let mut keys = Vec::with_capacity(count as usize);
        for offset in 0..count {
            keys.push(OneTimePreKey::generate(first_id + offset, self.env.random_array()?, now));
        }
        self.store.store_one_time_pre_keys(&keys)?;

        info!(count, first_id, "generated one-time pre-keys");
        Ok(keys)
    }

    /// Newest signed pre-key that has not been superseded.
    pub fn current_signed_pre_key(&self) -> Result<Option<SignedPreKey>, EngineError> {
        Ok(self
            .store
            .list_signed_pre_keys()?
            .into_iter()
            .filter(|key| key.superseded_at().is_none())
            .max_by_key(SignedPreKey::key_id))
    }

    /// Replace the current signed pre-key.
    ///
    /// The previous key stays usable for the grace period so sessions
    /// started against the old bundle still complete.
    pub fn rotate_signed_pre_key(
        &self,
        identity: &IdentityKeyPair,
    ) -> Result<SignedPreKey, EngineError> {
        let now = self.env.now_secs();
        for mut key in self.store.list_signed_pre_keys()? {
            if key.superseded_at().is_none() {
                key.supersede(now);
                self.store.store_signed_pre_key(&key)?;
            }
        }
        self.generate_signed_pre_key(identity)
    }

    /// Delete superseded signed pre-keys whose grace window has closed.
    pub fn purge_expired_signed_pre_keys(&self) -> Result<Vec<u32>, EngineError> {
        let now = self.env.now_secs();
        let mut purged = Vec::new();
        for key in self.store.list_signed_pre_keys()? {
            if key.is_expired(now, &self.policy) {
                self.store.remove_signed_pre_key(key.key_id())?;
                purged.push(key.key_id());
            }
        }
        if !purged.is_empty() {
            info!(?purged, "deleted expired signed pre-keys");
        }
        Ok(purged)
    }

    /// Number of one-time pre-keys not yet consumed.
    pub fn unused_one_time_count(&self) -> Result<usize, EngineError> {
        Ok(self.store.count_unused_one_time_pre_keys()?)
    }

    /// Top the pool back up to the batch size when `available` has fallen
    /// below the low-water mark.
    ///
    /// `available` is what the key directory still holds; it drops as soon
    /// as bundles are fetched, ahead of the local count.
    pub fn replenish_if_below(&self, available: usize) -> Result<Vec<OneTimePreKey>, EngineError> {
        if available >= self.policy.low_water_mark as usize {
            return Ok(Vec::new());
        }
        let missing = (self.policy.batch_size as usize).saturating_sub(available);
        self.generate_one_time_pre_keys(missing as u32)
    }

    /// [`replenish_if_below`](Self::replenish_if_below) using the local
    /// unused count.
    pub fn replenish_one_time_pre_keys(&self) -> Result<Vec<OneTimePreKey>, EngineError> {
        self.replenish_if_below(self.unused_one_time_count()?)
    }

    /// Rotate, purge and replenish as the policy requires.
    ///
    /// `directory_available` is the directory's remaining one-time count
    /// when known; otherwise the local unused count is used.
    pub fn run_maintenance(
        &self,
        identity: &IdentityKeyPair,
        directory_available: Option<usize>,
    ) -> Result<MaintenanceReport, EngineError> {
        let now = self.env.now_secs();
        let mut report = MaintenanceReport::default();

        let rotation_due = match self.current_signed_pre_key()? {
            Some(current) => {
                now.saturating_sub(current.created_at()) >= self.policy.rotation_interval.as_secs()
            },
            None => true,
        };
        if rotation_due {
            report.rotated_signed_pre_key = Some(self.rotate_signed_pre_key(identity)?.key_id());
        }

        report.expired_signed_pre_keys = self.purge_expired_signed_pre_keys()?;

        let available = match directory_available {
            Some(count) => count,
            None => self.unused_one_time_count()?,
        };
        report.new_one_time_pre_keys =
            self.replenish_if_below(available)?.iter().map(OneTimePreKey::public).collect();

        debug!(
            rotated = report.rotated_signed_pre_key.is_some(),
            expired = report.expired_signed_pre_keys.len(),
            replenished = report.new_one_time_pre_keys.len(),
            "pre-key maintenance complete"
        );
        Ok(report)
    }

    /// Upload for the key directory: current signed pre-key plus the newest
    /// 100 unused one-time pre-keys.
    pub fn key_upload(&self, identity: &IdentityKeyPair) -> Result<KeyUpload, EngineError> {
        let signed_pre_key = self
            .current_signed_pre_key()?
            .ok_or_else(|| EngineError::KeyGenerationFailed {
                reason: "no signed pre-key generated".to_string(),
            })?
            .public();

        let unused: Vec<_> =
            self.store.list_one_time_pre_keys()?.into_iter().filter(|key| !key.is_used()).collect();
        let oldest_sent = unused.len().saturating_sub(MAX_ONE_TIME_UPLOAD);
        let one_time_pre_keys = unused[oldest_sent..].iter().map(OneTimePreKey::public).collect();

        Ok(KeyUpload { identity_key: identity.public_key(), signed_pre_key, one_time_pre_keys })
    }
}
