//! Redb-backed durable key store.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Every
//! value is CBOR sealed with `XChaCha20-Poly1305` under a caller-held
//! [`StorageKey`], bound to its table and row key, so a copied database file
//! reveals nothing and a row moved between keys fails to open.

use std::{fmt, path::Path, sync::Arc};

use hushline_crypto::{IdentityKeyPair, KEY_SIZE, NONCE_SIZE, open, seal};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{KeyStore, StorageError, sender_key_id};
use crate::{
    address::PeerAddress,
    group::SenderKeyRecord,
    prekeys::{OneTimePreKey, SignedPreKey},
    session::Session,
};

/// A table of sealed records keyed by bytes.
#[derive(Clone, Copy)]
struct Table {
    name: &'static str,
}

impl Table {
    const fn definition(self) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
        TableDefinition::new(self.name)
    }
}

/// Key: `b"local"`. Value: sealed identity seed
const IDENTITY: Table = Table { name: "identity" };

/// Key: key id (u32 BE). Value: sealed `SignedPreKey`
const SIGNED_PRE_KEYS: Table = Table { name: "signed_pre_keys" };

/// Key: key id (u32 BE). Value: sealed `OneTimePreKey`
const ONE_TIME_PRE_KEYS: Table = Table { name: "one_time_pre_keys" };

/// Key: `PeerAddress::storage_key`. Value: sealed `Session`
const SESSIONS: Table = Table { name: "sessions" };

/// Key: `sender_key_id(group, sender)`. Value: sealed `SenderKeyRecord`
const SENDER_KEYS: Table = Table { name: "sender_keys" };

const IDENTITY_ROW: &[u8] = b"local";

fn io(err: impl fmt::Display) -> StorageError {
    StorageError::Io(err.to_string())
}

/// Key encrypting every record in a [`RedbKeyStore`].
///
/// Zeroized on drop. Where it is kept (keychain, secure enclave, file) is the
/// caller's concern.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StorageKey([u8; KEY_SIZE]);

impl StorageKey {
    /// Wrap existing key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Fresh key from OS entropy.
    pub fn generate() -> Result<Self, StorageError> {
        let mut bytes = [0u8; KEY_SIZE];
        getrandom::fill(&mut bytes).map_err(io)?;
        Ok(Self(bytes))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StorageKey(..)")
    }
}

/// Durable key store backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbKeyStore {
    db: Arc<Database>,
    key: Arc<StorageKey>,
}

impl RedbKeyStore {
    /// Open or create a database at `path`, sealing records under `key`.
    ///
    /// Creates the tables if they don't exist. Opening with the wrong key
    /// succeeds; reads then fail with [`StorageError::Corrupted`].
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>, key: StorageKey) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        for table in [IDENTITY, SIGNED_PRE_KEYS, ONE_TIME_PRE_KEYS, SESSIONS, SENDER_KEYS] {
            let _ = txn.open_table(table.definition()).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db), key: Arc::new(key) })
    }

    /// `table name || 0x00 || row key`
    fn associated_data(table: Table, row: &[u8]) -> Vec<u8> {
        let mut ad = Vec::with_capacity(table.name.len() + 1 + row.len());
        ad.extend_from_slice(table.name.as_bytes());
        ad.push(0);
        ad.extend_from_slice(row);
        ad
    }

    /// `nonce || ciphertext` of the CBOR encoding of `value`.
    fn seal_record<T: Serialize>(
        &self,
        table: Table,
        row: &[u8],
        value: &T,
    ) -> Result<Vec<u8>, StorageError> {
        let mut plaintext = Zeroizing::new(Vec::new());
        ciborium::into_writer(value, &mut *plaintext)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::fill(&mut nonce).map_err(io)?;

        let ciphertext =
            seal(self.key.as_bytes(), &nonce, &plaintext, &Self::associated_data(table, row));
        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open_record<T: DeserializeOwned>(
        &self,
        table: Table,
        row: &[u8],
        sealed: &[u8],
    ) -> Result<T, StorageError> {
        let corrupted = || StorageError::Corrupted { table: table.name };

        let (nonce, ciphertext) = sealed.split_first_chunk::<NONCE_SIZE>().ok_or_else(corrupted)?;
        let plaintext = Zeroizing::new(
            open(self.key.as_bytes(), nonce, ciphertext, &Self::associated_data(table, row))
                .map_err(|_| corrupted())?,
        );

        ciborium::from_reader(plaintext.as_slice())
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn put<T: Serialize>(&self, table: Table, row: &[u8], value: &T) -> Result<(), StorageError> {
        let sealed = self.seal_record(table, row, value)?;

        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut handle = txn.open_table(table.definition()).map_err(io)?;
            handle.insert(row, sealed.as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)
    }

    fn get<T: DeserializeOwned>(&self, table: Table, row: &[u8]) -> Result<Option<T>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let handle = txn.open_table(table.definition()).map_err(io)?;

        match handle.get(row).map_err(io)? {
            Some(sealed) => self.open_record(table, row, sealed.value()).map(Some),
            None => Ok(None),
        }
    }

    fn all<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<T>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let handle = txn.open_table(table.definition()).map_err(io)?;

        let mut values = Vec::new();
        for entry in handle.iter().map_err(io)? {
            let (row, sealed) = entry.map_err(io)?;
            values.push(self.open_record(table, row.value(), sealed.value())?);
        }
        Ok(values)
    }

    fn delete(&self, table: Table, row: &[u8]) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut handle = txn.open_table(table.definition()).map_err(io)?;
            handle.remove(row).map_err(io)?;
        }
        txn.commit().map_err(io)
    }
}

impl KeyStore for RedbKeyStore {
    fn load_identity(&self) -> Result<Option<IdentityKeyPair>, StorageError> {
        self.get(IDENTITY, IDENTITY_ROW)
    }

    fn initialize_identity(
        &self,
        candidate: &IdentityKeyPair,
    ) -> Result<IdentityKeyPair, StorageError> {
        let sealed = self.seal_record(IDENTITY, IDENTITY_ROW, candidate)?;

        let txn = self.db.begin_write().map_err(io)?;
        let existing = {
            let mut handle = txn.open_table(IDENTITY.definition()).map_err(io)?;
            let existing = handle.get(IDENTITY_ROW).map_err(io)?.map(|value| value.value().to_vec());
            if existing.is_none() {
                handle.insert(IDENTITY_ROW, sealed.as_slice()).map_err(io)?;
            }
            existing
        };
        txn.commit().map_err(io)?;

        match existing {
            Some(stored) => self.open_record(IDENTITY, IDENTITY_ROW, &stored),
            None => Ok(candidate.clone()),
        }
    }

    fn store_signed_pre_key(&self, key: &SignedPreKey) -> Result<(), StorageError> {
        self.put(SIGNED_PRE_KEYS, &key.key_id().to_be_bytes(), key)
    }

    fn load_signed_pre_key(&self, key_id: u32) -> Result<Option<SignedPreKey>, StorageError> {
        self.get(SIGNED_PRE_KEYS, &key_id.to_be_bytes())
    }

    fn list_signed_pre_keys(&self) -> Result<Vec<SignedPreKey>, StorageError> {
        self.all(SIGNED_PRE_KEYS)
    }

    fn remove_signed_pre_key(&self, key_id: u32) -> Result<(), StorageError> {
        self.delete(SIGNED_PRE_KEYS, &key_id.to_be_bytes())
    }

    fn store_one_time_pre_keys(&self, keys: &[OneTimePreKey]) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut handle = txn.open_table(ONE_TIME_PRE_KEYS.definition()).map_err(io)?;
            for key in keys {
                let row = key.key_id().to_be_bytes();
                if handle.get(row.as_slice()).map_err(io)?.is_some() {
                    continue;
                }
                let sealed = self.seal_record(ONE_TIME_PRE_KEYS, &row, key)?;
                handle.insert(row.as_slice(), sealed.as_slice()).map_err(io)?;
            }
        }
        txn.commit().map_err(io)
    }

    fn load_one_time_pre_key(&self, key_id: u32) -> Result<Option<OneTimePreKey>, StorageError> {
        self.get(ONE_TIME_PRE_KEYS, &key_id.to_be_bytes())
    }

    fn consume_one_time_pre_key(&self, key_id: u32) -> Result<bool, StorageError> {
        let row = key_id.to_be_bytes();

        let txn = self.db.begin_write().map_err(io)?;
        let consumed = {
            let mut handle = txn.open_table(ONE_TIME_PRE_KEYS.definition()).map_err(io)?;
            let stored = handle.get(row.as_slice()).map_err(io)?.map(|value| value.value().to_vec());

            match stored {
                Some(sealed) => {
                    let mut key: OneTimePreKey =
                        self.open_record(ONE_TIME_PRE_KEYS, &row, &sealed)?;
                    if key.is_used() {
                        false
                    } else {
                        key.consume();
                        let resealed = self.seal_record(ONE_TIME_PRE_KEYS, &row, &key)?;
                        handle.insert(row.as_slice(), resealed.as_slice()).map_err(io)?;
                        true
                    }
                },
                None => false,
            }
        };
        txn.commit().map_err(io)?;

        Ok(consumed)
    }

    fn list_one_time_pre_keys(&self) -> Result<Vec<OneTimePreKey>, StorageError> {
        self.all(ONE_TIME_PRE_KEYS)
    }

    fn load_session(&self, peer: &PeerAddress) -> Result<Option<Session>, StorageError> {
        self.get(SESSIONS, &peer.storage_key())
    }

    fn store_session(&self, peer: &PeerAddress, session: &Session) -> Result<(), StorageError> {
        self.put(SESSIONS, &peer.storage_key(), session)
    }

    fn delete_session(&self, peer: &PeerAddress) -> Result<(), StorageError> {
        self.delete(SESSIONS, &peer.storage_key())
    }

    fn list_sessions(&self) -> Result<Vec<PeerAddress>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let handle = txn.open_table(SESSIONS.definition()).map_err(io)?;

        let mut peers = Vec::new();
        for entry in handle.iter().map_err(io)? {
            let (row, _) = entry.map_err(io)?;
            let peer = PeerAddress::from_storage_key(row.value())
                .ok_or(StorageError::Corrupted { table: SESSIONS.name })?;
            peers.push(peer);
        }
        peers.sort();
        Ok(peers)
    }

    fn load_sender_key(
        &self,
        group_id: &str,
        sender: &PeerAddress,
    ) -> Result<Option<SenderKeyRecord>, StorageError> {
        self.get(SENDER_KEYS, &sender_key_id(group_id, sender))
    }

    fn store_sender_key(&self, record: &SenderKeyRecord) -> Result<(), StorageError> {
        self.put(SENDER_KEYS, &sender_key_id(record.group_id(), record.sender()), record)
    }

    fn delete_sender_key(
        &self,
        group_id: &str,
        sender: &PeerAddress,
    ) -> Result<(), StorageError> {
        self.delete(SENDER_KEYS, &sender_key_id(group_id, sender))
    }

    fn list_sender_keys(&self) -> Result<Vec<SenderKeyRecord>, StorageError> {
        self.all(SENDER_KEYS)
    }
}
