//! Per-key mutual exclusion.
//!
//! Encrypt and decrypt on one session both read-modify-write the same
//! record, so they must not interleave. Different keys never contend.

#![allow(clippy::disallowed_types, reason = "Short critical sections around store calls")]

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex, PoisonError},
};

/// Lazily created mutex per key. Clones share the lock table.
#[derive(Debug)]
pub(crate) struct KeyedLocks<K> {
    inner: Arc<Mutex<HashMap<K, Arc<Mutex<()>>>>>,
}

impl<K> Clone for KeyedLocks<K> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub(crate) fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// The mutex guarding `key`. Lock it with [`lock`].
    pub(crate) fn handle(&self, key: &K) -> Arc<Mutex<()>> {
        let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(table.entry(key.clone()).or_default())
    }

    /// Drop the mutex for `key` once nobody holds it.
    pub(crate) fn forget(&self, key: &K) {
        let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if table.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            table.remove(key);
        }
    }
}

/// Acquire `handle`. A panic in another holder does not leave the guarded
/// record half-written (writes go through the store), so poisoning is
/// ignored.
pub(crate) fn lock(handle: &Mutex<()>) -> std::sync::MutexGuard<'_, ()> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}
