#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use hushline_crypto::IdentityKeyPair;

use super::{KeyStore, StorageError, sender_key_id};
use crate::{
    address::PeerAddress,
    group::SenderKeyRecord,
    prekeys::{OneTimePreKey, SignedPreKey},
    session::Session,
};

/// In-memory key store for testing and simulation
///
/// All state is wrapped in Arc<Mutex<>> so clones share it. Uses
/// `lock().expect()`, which panics if the mutex is poisoned; acceptable for
/// test code. `BTreeMap`s keep listings ordered.
#[derive(Clone)]
pub struct MemoryKeyStore {
    inner: Arc<Mutex<MemoryKeyStoreInner>>,
}

#[derive(Default)]
struct MemoryKeyStoreInner {
    identity: Option<IdentityKeyPair>,
    signed_pre_keys: BTreeMap<u32, SignedPreKey>,
    one_time_pre_keys: BTreeMap<u32, OneTimePreKey>,
    sessions: BTreeMap<PeerAddress, Session>,
    sender_keys: BTreeMap<Vec<u8>, SenderKeyRecord>,
}

impl MemoryKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(MemoryKeyStoreInner::default())) }
    }

    /// Number of stored sessions.
    #[allow(clippy::expect_used)]
    pub fn session_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").sessions.len()
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for MemoryKeyStore {
    #[allow(clippy::expect_used)]
    fn load_identity(&self) -> Result<Option<IdentityKeyPair>, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").identity.clone())
    }

    #[allow(clippy::expect_used)]
    fn initialize_identity(
        &self,
        candidate: &IdentityKeyPair,
    ) -> Result<IdentityKeyPair, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.identity.get_or_insert_with(|| candidate.clone()).clone())
    }

    #[allow(clippy::expect_used)]
    fn store_signed_pre_key(&self, key: &SignedPreKey) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        inner.signed_pre_keys.insert(key.key_id(), key.clone());
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn load_signed_pre_key(&self, key_id: u32) -> Result<Option<SignedPreKey>, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").signed_pre_keys.get(&key_id).cloned())
    }

    #[allow(clippy::expect_used)]
    fn list_signed_pre_keys(&self) -> Result<Vec<SignedPreKey>, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").signed_pre_keys.values().cloned().collect())
    }

    #[allow(clippy::expect_used)]
    fn remove_signed_pre_key(&self, key_id: u32) -> Result<(), StorageError> {
        self.inner.lock().expect("Mutex poisoned").signed_pre_keys.remove(&key_id);
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn store_one_time_pre_keys(&self, keys: &[OneTimePreKey]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        for key in keys {
            inner.one_time_pre_keys.entry(key.key_id()).or_insert_with(|| key.clone());
        }
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn load_one_time_pre_key(&self, key_id: u32) -> Result<Option<OneTimePreKey>, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").one_time_pre_keys.get(&key_id).cloned())
    }

    #[allow(clippy::expect_used)]
    fn consume_one_time_pre_key(&self, key_id: u32) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        match inner.one_time_pre_keys.get_mut(&key_id) {
            Some(key) if !key.is_used() => {
                key.consume();
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    #[allow(clippy::expect_used)]
    fn list_one_time_pre_keys(&self) -> Result<Vec<OneTimePreKey>, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").one_time_pre_keys.values().cloned().collect())
    }

    #[allow(clippy::expect_used)]
    fn load_session(&self, peer: &PeerAddress) -> Result<Option<Session>, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").sessions.get(peer).cloned())
    }

    #[allow(clippy::expect_used)]
    fn store_session(&self, peer: &PeerAddress, session: &Session) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        inner.sessions.insert(peer.clone(), session.clone());
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn delete_session(&self, peer: &PeerAddress) -> Result<(), StorageError> {
        self.inner.lock().expect("Mutex poisoned").sessions.remove(peer);
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn list_sessions(&self) -> Result<Vec<PeerAddress>, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").sessions.keys().cloned().collect())
    }

    #[allow(clippy::expect_used)]
    fn load_sender_key(
        &self,
        group_id: &str,
        sender: &PeerAddress,
    ) -> Result<Option<SenderKeyRecord>, StorageError> {
        let key = sender_key_id(group_id, sender);
        Ok(self.inner.lock().expect("Mutex poisoned").sender_keys.get(&key).cloned())
    }

    #[allow(clippy::expect_used)]
    fn store_sender_key(&self, record: &SenderKeyRecord) -> Result<(), StorageError> {
        let key = sender_key_id(record.group_id(), record.sender());
        self.inner.lock().expect("Mutex poisoned").sender_keys.insert(key, record.clone());
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn delete_sender_key(
        &self,
        group_id: &str,
        sender: &PeerAddress,
    ) -> Result<(), StorageError> {
        let key = sender_key_id(group_id, sender);
        self.inner.lock().expect("Mutex poisoned").sender_keys.remove(&key);
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn list_sender_keys(&self) -> Result<Vec<SenderKeyRecord>, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").sender_keys.values().cloned().collect())
    }
}
