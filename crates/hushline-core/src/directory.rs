//! Key directory interface.
//!
//! The directory is an external, untrusted-for-confidentiality service that
//! stores public pre-key material and hands out bundles. It is trusted only
//! for availability: initiators verify every bundle signature themselves.

#![allow(clippy::disallowed_types, reason = "In-memory directory for tests and simulation")]

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use hushline_crypto::IdentityKey;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::{MAX_ONE_TIME_UPLOAD, MIN_ONE_TIME_UPLOAD},
    prekeys::{
        KeyUpload, OneTimePreKeyPublic, PreKeyBundle, SignedPreKeyPublic, verify_signed_pre_key,
    },
};

/// Errors returned by a [`KeyDirectory`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// No keys published for the user
    #[error("no keys published for {user_id}")]
    UnknownUser {
        /// Requested user
        user_id: String,
    },

    /// Upload rejected
    #[error("invalid upload: {reason}")]
    InvalidUpload {
        /// Why
        reason: String,
    },

    /// Signed pre-key does not verify under the identity key
    #[error("signed pre-key signature invalid")]
    InvalidSignature,

    /// Directory backend failed
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Publishing and fetching pre-key bundles.
pub trait KeyDirectory: Send + Sync {
    /// Publish keys for `user_id` (`PUT /keys`).
    ///
    /// Replaces the identity and signed pre-key and appends one-time
    /// pre-keys not seen before. An upload under a new identity key resets
    /// the one-time pool.
    fn publish(&self, user_id: &str, upload: &KeyUpload) -> Result<(), DirectoryError>;

    /// Replace only the signed pre-key.
    fn update_signed_pre_key(
        &self,
        user_id: &str,
        signed_pre_key: &SignedPreKeyPublic,
    ) -> Result<(), DirectoryError>;

    /// Bundle for `user_id` (`GET /keys/{user}`).
    ///
    /// The returned one-time pre-key is removed from the pool atomically, so
    /// no two callers receive the same key.
    fn fetch_bundle(&self, user_id: &str) -> Result<PreKeyBundle, DirectoryError>;

    /// One-time pre-keys still available for `user_id`.
    fn count_available(&self, user_id: &str) -> Result<usize, DirectoryError>;
}

struct DirectoryEntry {
    identity_key: IdentityKey,
    signed_pre_key: SignedPreKeyPublic,
    one_time_pre_keys: VecDeque<OneTimePreKeyPublic>,
    /// Every one-time id ever accepted, so re-uploads never reissue a key
    seen_ids: BTreeSet<u32>,
}

/// In-memory [`KeyDirectory`].
///
/// Clones share state.
#[derive(Clone, Default)]
pub struct MemoryKeyDirectory {
    entries: Arc<Mutex<HashMap<String, DirectoryEntry>>>,
}

impl MemoryKeyDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }
}

fn unknown(user_id: &str) -> DirectoryError {
    DirectoryError::UnknownUser { user_id: user_id.to_string() }
}

impl KeyDirectory for MemoryKeyDirectory {
    fn publish(&self, user_id: &str, upload: &KeyUpload) -> Result<(), DirectoryError> {
        let count = upload.one_time_pre_keys.len();
        if !(MIN_ONE_TIME_UPLOAD..=MAX_ONE_TIME_UPLOAD).contains(&count) {
            return Err(DirectoryError::InvalidUpload {
                reason: format!(
                    "{count} one-time pre-keys; expected {MIN_ONE_TIME_UPLOAD} to {MAX_ONE_TIME_UPLOAD}"
                ),
            });
        }
        verify_signed_pre_key(&upload.identity_key, &upload.signed_pre_key)
            .map_err(|_| DirectoryError::InvalidSignature)?;

        #[allow(clippy::expect_used)]
        let mut entries = self.entries.lock().expect("Mutex poisoned");
        let entry = entries.entry(user_id.to_string()).or_insert_with(|| DirectoryEntry {
            identity_key: upload.identity_key,
            signed_pre_key: upload.signed_pre_key,
            one_time_pre_keys: VecDeque::new(),
            seen_ids: BTreeSet::new(),
        });

        if entry.identity_key != upload.identity_key {
            info!(user_id, "identity key replaced; one-time pool reset");
            entry.identity_key = upload.identity_key;
            entry.one_time_pre_keys.clear();
            entry.seen_ids.clear();
        }
        entry.signed_pre_key = upload.signed_pre_key;

        let mut added = 0;
        for key in &upload.one_time_pre_keys {
            if entry.seen_ids.insert(key.key_id) {
                entry.one_time_pre_keys.push_back(*key);
                added += 1;
            }
        }

        debug!(user_id, added, available = entry.one_time_pre_keys.len(), "published keys");
        Ok(())
    }

    fn update_signed_pre_key(
        &self,
        user_id: &str,
        signed_pre_key: &SignedPreKeyPublic,
    ) -> Result<(), DirectoryError> {
        #[allow(clippy::expect_used)]
        let mut entries = self.entries.lock().expect("Mutex poisoned");
        let entry = entries.get_mut(user_id).ok_or_else(|| unknown(user_id))?;

        verify_signed_pre_key(&entry.identity_key, signed_pre_key)
            .map_err(|_| DirectoryError::InvalidSignature)?;
        entry.signed_pre_key = *signed_pre_key;
        Ok(())
    }

    fn fetch_bundle(&self, user_id: &str) -> Result<PreKeyBundle, DirectoryError> {
        #[allow(clippy::expect_used)]
        let mut entries = self.entries.lock().expect("Mutex poisoned");
        let entry = entries.get_mut(user_id).ok_or_else(|| unknown(user_id))?;

        Ok(PreKeyBundle {
            identity_key: entry.identity_key,
            signed_pre_key: entry.signed_pre_key,
            one_time_pre_key: entry.one_time_pre_keys.pop_front(),
        })
    }

    fn count_available(&self, user_id: &str) -> Result<usize, DirectoryError> {
        #[allow(clippy::expect_used)]
        let entries = self.entries.lock().expect("Mutex poisoned");
        entries
            .get(user_id)
            .map(|entry| entry.one_time_pre_keys.len())
            .ok_or_else(|| unknown(user_id))
    }
}
