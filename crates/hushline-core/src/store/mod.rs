//! Key store abstraction.
//!
//! Persists identity, pre-keys, sessions and sender keys. The trait is
//! synchronous. Implementations share state across clones, so a manager and
//! the tests inspecting it see the same data.
//!
//! Every multi-step invariant the engine relies on is a single call here:
//! [`KeyStore::initialize_identity`] is insert-if-absent and
//! [`KeyStore::consume_one_time_pre_key`] is check-and-set, so two racing
//! callers can never both win.

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticKeyStore;
pub use error::StorageError;
use hushline_crypto::IdentityKeyPair;
pub use memory::MemoryKeyStore;

pub use self::redb::{RedbKeyStore, StorageKey};
use crate::{
    address::PeerAddress,
    group::SenderKeyRecord,
    prekeys::{OneTimePreKey, SignedPreKey},
    session::Session,
};

/// Storage for all local key material.
///
/// Must be Clone (shared by several managers), Send + Sync, and synchronous.
pub trait KeyStore: Clone + Send + Sync + 'static {
    /// Load the identity key pair, if one exists.
    fn load_identity(&self) -> Result<Option<IdentityKeyPair>, StorageError>;

    /// Store `candidate` unless an identity already exists.
    ///
    /// Returns whichever identity is stored after the call. Two concurrent
    /// callers observe the same identity.
    fn initialize_identity(
        &self,
        candidate: &IdentityKeyPair,
    ) -> Result<IdentityKeyPair, StorageError>;

    /// Insert or replace a signed pre-key.
    fn store_signed_pre_key(&self, key: &SignedPreKey) -> Result<(), StorageError>;

    /// Load a signed pre-key by id.
    fn load_signed_pre_key(&self, key_id: u32) -> Result<Option<SignedPreKey>, StorageError>;

    /// All signed pre-keys, ordered by id.
    fn list_signed_pre_keys(&self) -> Result<Vec<SignedPreKey>, StorageError>;

    /// Delete a signed pre-key. Deleting a missing key is a no-op.
    fn remove_signed_pre_key(&self, key_id: u32) -> Result<(), StorageError>;

    /// Insert one-time pre-keys. Existing ids are left untouched.
    fn store_one_time_pre_keys(&self, keys: &[OneTimePreKey]) -> Result<(), StorageError>;

    /// Load a one-time pre-key by id, consumed or not.
    fn load_one_time_pre_key(&self, key_id: u32) -> Result<Option<OneTimePreKey>, StorageError>;

    /// Atomically mark a one-time pre-key consumed and erase its secret.
    ///
    /// Returns `false` if the key is missing or already consumed.
    fn consume_one_time_pre_key(&self, key_id: u32) -> Result<bool, StorageError>;

    /// All one-time pre-keys, ordered by id.
    fn list_one_time_pre_keys(&self) -> Result<Vec<OneTimePreKey>, StorageError>;

    /// Number of one-time pre-keys not yet consumed.
    fn count_unused_one_time_pre_keys(&self) -> Result<usize, StorageError> {
        Ok(self.list_one_time_pre_keys()?.iter().filter(|key| !key.is_used()).count())
    }

    /// Load the session with `peer`.
    fn load_session(&self, peer: &PeerAddress) -> Result<Option<Session>, StorageError>;

    /// Insert or replace the session with `peer`.
    fn store_session(&self, peer: &PeerAddress, session: &Session) -> Result<(), StorageError>;

    /// Delete the session with `peer`. Deleting a missing session is a no-op.
    fn delete_session(&self, peer: &PeerAddress) -> Result<(), StorageError>;

    /// Every peer with a stored session, ordered.
    fn list_sessions(&self) -> Result<Vec<PeerAddress>, StorageError>;

    /// Load the sender key `sender` uses in `group_id`.
    fn load_sender_key(
        &self,
        group_id: &str,
        sender: &PeerAddress,
    ) -> Result<Option<SenderKeyRecord>, StorageError>;

    /// Insert or replace a sender key record.
    fn store_sender_key(&self, record: &SenderKeyRecord) -> Result<(), StorageError>;

    /// Delete a sender key record. Deleting a missing record is a no-op.
    fn delete_sender_key(&self, group_id: &str, sender: &PeerAddress)
    -> Result<(), StorageError>;

    /// Every stored sender key record.
    fn list_sender_keys(&self) -> Result<Vec<SenderKeyRecord>, StorageError>;
}

/// Composite key for sender key tables: `len(group_id) || group_id ||
/// peer storage key`.
pub(crate) fn sender_key_id(group_id: &str, sender: &PeerAddress) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + group_id.len() + 4 + sender.user_id().len());
    key.extend_from_slice(&(group_id.len() as u32).to_be_bytes());
    key.extend_from_slice(group_id.as_bytes());
    key.extend_from_slice(&sender.storage_key());
    key
}
