//! Cache of message keys derived ahead of delivery.
//!
//! Entries are evicted oldest-first past the configured count and purged
//! once older than the configured age. A key is removed only when it is
//! taken; callers run decryption on a copy of the owning state so a failed
//! attempt leaves the entry in place.

use std::{collections::VecDeque, fmt};

use hushline_crypto::MessageKey;
use serde::{Deserialize, Serialize};

use crate::config::SkippedKeyPolicy;

#[derive(Clone, Serialize, Deserialize)]
struct SkippedEntry<K> {
    id: K,
    key: MessageKey,
    stored_at: u64,
}

/// Result of a cache lookup.
#[derive(Debug)]
pub enum Lookup {
    /// Key found and removed
    Hit(MessageKey),
    /// Key was cached but exceeded its retention age; now removed
    Expired,
    /// No key cached under this id
    Miss,
}

/// Skipped message keys keyed by `K`.
///
/// Pairwise sessions key by `(ratchet public key, counter)`; sender keys
/// key by iteration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SkippedKeyCache<K> {
    entries: VecDeque<SkippedEntry<K>>,
}

impl<K> Default for SkippedKeyCache<K> {
    fn default() -> Self {
        Self { entries: VecDeque::new() }
    }
}

impl<K: PartialEq> SkippedKeyCache<K> {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cache `key` under `id`, evicting the oldest entries past the count
    /// limit. Returns the number evicted.
    pub fn insert(&mut self, id: K, key: MessageKey, now: u64, policy: &SkippedKeyPolicy) -> usize {
        self.entries.push_back(SkippedEntry { id, key, stored_at: now });

        let mut evicted = 0;
        while self.entries.len() > policy.max_entries {
            self.entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Remove and return the key cached under `id`.
    pub fn take(&mut self, id: &K, now: u64, policy: &SkippedKeyPolicy) -> Lookup {
        let Some(position) = self.entries.iter().position(|entry| entry.id == *id) else {
            return Lookup::Miss;
        };
        let Some(entry) = self.entries.remove(position) else {
            return Lookup::Miss;
        };

        if is_expired(entry.stored_at, now, policy) {
            Lookup::Expired
        } else {
            Lookup::Hit(entry.key)
        }
    }

    /// Drop entries older than the retention age. Returns the number purged.
    pub fn purge_expired(&mut self, now: u64, policy: &SkippedKeyPolicy) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| !is_expired(entry.stored_at, now, policy));
        before - self.entries.len()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn is_expired(stored_at: u64, now: u64, policy: &SkippedKeyPolicy) -> bool {
    now.saturating_sub(stored_at) > policy.max_age.as_secs()
}

impl<K> fmt::Debug for SkippedKeyCache<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkippedKeyCache").field("len", &self.entries.len()).finish()
    }
}
