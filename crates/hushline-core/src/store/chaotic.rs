//! Fault-injecting key store wrapper.
//!
//! Fails a configurable fraction of operations with a transient I/O error so
//! tests can check that no engine operation leaves state half-applied.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use hushline_crypto::IdentityKeyPair;

use super::{KeyStore, StorageError};
use crate::{
    address::PeerAddress,
    group::SenderKeyRecord,
    prekeys::{OneTimePreKey, SignedPreKey},
    session::Session,
};

/// Wrapper that randomly fails operations on an inner [`KeyStore`].
///
/// Failures happen before the inner store is touched, so a failed call has
/// no effect. Clones share the RNG and the operation counter.
#[derive(Clone)]
pub struct ChaoticKeyStore<S: KeyStore> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    rng: Arc<Mutex<ChaoticRng>>,
    operations: Arc<AtomicUsize>,
}

/// Linear congruential generator; reproducible for a given seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // Numerical Recipes constants
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: KeyStore> ChaoticKeyStore<S> {
    /// Wrap `inner` with a fixed default seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Wrap `inner` with an explicit seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng { state: seed })),
            operations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying store, for checking state after chaos.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total operations attempted, failed or not.
    pub fn operation_count(&self) -> usize {
        self.operations.load(Ordering::Relaxed)
    }

    fn inject(&self) -> Result<(), StorageError> {
        self.operations.fetch_add(1, Ordering::Relaxed);

        #[allow(clippy::expect_used)]
        let roll = self.rng.lock().expect("ChaoticRng mutex poisoned").next();
        if roll < self.failure_rate {
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        Ok(())
    }
}

impl<S: KeyStore> KeyStore for ChaoticKeyStore<S> {
    fn load_identity(&self) -> Result<Option<IdentityKeyPair>, StorageError> {
        self.inject()?;
        self.inner.load_identity()
    }

    fn initialize_identity(
        &self,
        candidate: &IdentityKeyPair,
    ) -> Result<IdentityKeyPair, StorageError> {
        self.inject()?;
        self.inner.initialize_identity(candidate)
    }

    fn store_signed_pre_key(&self, key: &SignedPreKey) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.store_signed_pre_key(key)
    }

    fn load_signed_pre_key(&self, key_id: u32) -> Result<Option<SignedPreKey>, StorageError> {
        self.inject()?;
        self.inner.load_signed_pre_key(key_id)
    }

    fn list_signed_pre_keys(&self) -> Result<Vec<SignedPreKey>, StorageError> {
        self.inject()?;
        self.inner.list_signed_pre_keys()
    }

    fn remove_signed_pre_key(&self, key_id: u32) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.remove_signed_pre_key(key_id)
    }

    fn store_one_time_pre_keys(&self, keys: &[OneTimePreKey]) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.store_one_time_pre_keys(keys)
    }

    fn load_one_time_pre_key(&self, key_id: u32) -> Result<Option<OneTimePreKey>, StorageError> {
        self.inject()?;
        self.inner.load_one_time_pre_key(key_id)
    }

    fn consume_one_time_pre_key(&self, key_id: u32) -> Result<bool, StorageError> {
        self.inject()?;
        self.inner.consume_one_time_pre_key(key_id)
    }

    fn list_one_time_pre_keys(&self) -> Result<Vec<OneTimePreKey>, StorageError> {
        self.inject()?;
        self.inner.list_one_time_pre_keys()
    }

    fn load_session(&self, peer: &PeerAddress) -> Result<Option<Session>, StorageError> {
        self.inject()?;
        self.inner.load_session(peer)
    }

    fn store_session(&self, peer: &PeerAddress, session: &Session) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.store_session(peer, session)
    }

    fn delete_session(&self, peer: &PeerAddress) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.delete_session(peer)
    }

    fn list_sessions(&self) -> Result<Vec<PeerAddress>, StorageError> {
        self.inject()?;
        self.inner.list_sessions()
    }

    fn load_sender_key(
        &self,
        group_id: &str,
        sender: &PeerAddress,
    ) -> Result<Option<SenderKeyRecord>, StorageError> {
        self.inject()?;
        self.inner.load_sender_key(group_id, sender)
    }

    fn store_sender_key(&self, record: &SenderKeyRecord) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.store_sender_key(record)
    }

    fn delete_sender_key(
        &self,
        group_id: &str,
        sender: &PeerAddress,
    ) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.delete_sender_key(group_id, sender)
    }

    fn list_sender_keys(&self) -> Result<Vec<SenderKeyRecord>, StorageError> {
        self.inject()?;
        self.inner.list_sender_keys()
    }
}
