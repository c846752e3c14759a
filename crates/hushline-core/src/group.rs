//! Sender keys for group messages.
//!
//! Each member owns one symmetric chain per group and hands it to every
//! other member over their pairwise sessions. Group messages are encrypted
//! once under the sender's chain; the chain is a one-way ratchet with no DH
//! step.
//!
//! When a member leaves, the remaining senders rotate: a new key id, a new
//! random chain, distributed only to the members still present. Receivers
//! keep a superseded key for `sender_key_grace` so in-flight messages still
//! open, then [`GroupKeyManager::purge_retired`] erases it.

use hushline_crypto::{ChainKey, MessageKey, build_nonce, open, seal};
use hushline_proto::{Envelope, GroupMessage, SenderKeyDistribution};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::{
    address::PeerAddress,
    config::{EngineConfig, SkippedKeyPolicy},
    env::Environment,
    error::{DecryptFailure, EngineError},
    locks::{KeyedLocks, lock},
    manager::SessionManager,
    skipped::{Lookup, SkippedKeyCache},
    store::KeyStore,
};

/// One generation of a member's sender key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderKeyState {
    key_id: u32,
    chain: ChainKey,
    skipped: SkippedKeyCache<u32>,
    created_at: u64,
}

impl SenderKeyState {
    fn new(key_id: u32, chain: ChainKey, created_at: u64) -> Self {
        Self { key_id, chain, skipped: SkippedKeyCache::new(), created_at }
    }

    /// Generation number.
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    /// Next chain iteration.
    pub fn iteration(&self) -> u32 {
        self.chain.index()
    }

    /// Creation time.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    fn distribution(&self, group_id: &str) -> SenderKeyDistribution {
        SenderKeyDistribution {
            group_id: group_id.to_string(),
            key_id: self.key_id,
            iteration: self.chain.index(),
            chain_key: *self.chain.as_bytes(),
        }
    }

    /// Message key for `iteration`, from the cache if it lies behind the
    /// chain.
    fn message_key(
        &mut self,
        iteration: u32,
        now: u64,
        max_skip: u32,
        policy: &SkippedKeyPolicy,
    ) -> Result<MessageKey, EngineError> {
        if iteration < self.chain.index() {
            return match self.skipped.take(&iteration, now, policy) {
                Lookup::Hit(key) => Ok(key),
                Lookup::Expired => Err(EngineError::decryption(DecryptFailure::SkippedKeyExpired)),
                Lookup::Miss => Err(EngineError::decryption(DecryptFailure::Duplicate)),
            };
        }

        for key in self.chain.skip_to(iteration, max_skip)? {
            self.skipped.insert(key.index(), key, now, policy);
        }
        Ok(self.chain.advance()?)
    }
}

/// A superseded sender key kept for in-flight messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetiredSenderKey {
    state: SenderKeyState,
    retired_at: u64,
}

/// Everything known about one member's sender key in one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    group_id: String,
    sender: PeerAddress,
    current: SenderKeyState,
    retired: Vec<RetiredSenderKey>,
}

impl SenderKeyRecord {
    fn new(group_id: &str, sender: PeerAddress, current: SenderKeyState) -> Self {
        Self { group_id: group_id.to_string(), sender, current, retired: Vec::new() }
    }

    /// Group the key belongs to.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Member who encrypts with the key.
    pub fn sender(&self) -> &PeerAddress {
        &self.sender
    }

    /// Current generation.
    pub fn current_key_id(&self) -> u32 {
        self.current.key_id
    }

    /// Next iteration of the current generation.
    pub fn current_iteration(&self) -> u32 {
        self.current.iteration()
    }

    /// Superseded generations still retained.
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// State for `key_id`, if current or retired within `grace_secs`.
    fn state_mut(&mut self, key_id: u32, now: u64, grace_secs: u64) -> Option<&mut SenderKeyState> {
        if self.current.key_id == key_id {
            return Some(&mut self.current);
        }
        self.retired
            .iter_mut()
            .find(|retired| {
                retired.state.key_id == key_id
                    && now.saturating_sub(retired.retired_at) < grace_secs
            })
            .map(|retired| &mut retired.state)
    }

    /// Install `state` if it is newer than the current generation.
    fn install(&mut self, state: SenderKeyState, now: u64) -> bool {
        if state.key_id <= self.current.key_id {
            return false;
        }
        let previous = std::mem::replace(&mut self.current, state);
        self.retired.push(RetiredSenderKey { state: previous, retired_at: now });
        true
    }

    fn purge_retired(&mut self, now: u64, grace_secs: u64) -> usize {
        let before = self.retired.len();
        self.retired.retain(|retired| now.saturating_sub(retired.retired_at) < grace_secs);
        before - self.retired.len()
    }
}

/// Creates, distributes and uses sender keys.
#[derive(Clone)]
pub struct GroupKeyManager<S: KeyStore, E: Environment> {
    local: PeerAddress,
    store: S,
    env: E,
    sessions: SessionManager<S, E>,
    config: EngineConfig,
    locks: KeyedLocks<(String, PeerAddress)>,
}

impl<S: KeyStore, E: Environment> GroupKeyManager<S, E> {
    /// Manager for the device addressed as `local`, transporting keys over
    /// `sessions`.
    pub fn new(local: PeerAddress, sessions: SessionManager<S, E>) -> Self {
        Self {
            local,
            store: sessions.store().clone(),
            env: sessions.env().clone(),
            config: sessions.config().clone(),
            sessions,
            locks: KeyedLocks::new(),
        }
    }

    /// Address of this device.
    pub fn local(&self) -> &PeerAddress {
        &self.local
    }

    /// Start a new sender key generation for `group_id` and encrypt it to
    /// each of `members` (this device is skipped).
    ///
    /// Fails with [`EngineError::NoSession`] if a member has no pairwise
    /// session; the previous generation then stays current.
    pub fn create_sender_key(
        &self,
        group_id: &str,
        members: &[PeerAddress],
    ) -> Result<Vec<(PeerAddress, Envelope)>, EngineError> {
        let handle = self.locks.handle(&(group_id.to_string(), self.local.clone()));
        let _guard = lock(&handle);

        let key_id = self
            .store
            .load_sender_key(group_id, &self.local)?
            .map_or(1, |record| record.current_key_id() + 1);
        let state =
            SenderKeyState::new(key_id, ChainKey::new(self.env.random_array()?), self.env.now_secs());

        let envelopes = self.distribute(group_id, &state, members)?;
        self.store.store_sender_key(&SenderKeyRecord::new(group_id, self.local.clone(), state))?;

        info!(group_id, key_id, members = envelopes.len(), "created sender key");
        Ok(envelopes)
    }

    /// Send the current sender key to members who joined after it was
    /// created. They can decrypt from the current iteration onward.
    pub fn distribute_to(
        &self,
        group_id: &str,
        members: &[PeerAddress],
    ) -> Result<Vec<(PeerAddress, Envelope)>, EngineError> {
        let handle = self.locks.handle(&(group_id.to_string(), self.local.clone()));
        let _guard = lock(&handle);

        let record = self.own_record(group_id)?;
        self.distribute(group_id, &record.current, members)
    }

    /// Decrypt a distribution envelope from `sender` and install the key.
    ///
    /// Returns whether the key was installed; a generation no newer than
    /// the one held is ignored.
    pub fn process_distribution(
        &self,
        sender: &PeerAddress,
        envelope: &Envelope,
    ) -> Result<bool, EngineError> {
        let plaintext = Zeroizing::new(self.sessions.decrypt(sender, envelope)?);
        let distribution = SenderKeyDistribution::decode(&plaintext)?;
        self.install_distribution(sender, &distribution)
    }

    /// Install an already decrypted distribution from `sender`.
    pub fn install_distribution(
        &self,
        sender: &PeerAddress,
        distribution: &SenderKeyDistribution,
    ) -> Result<bool, EngineError> {
        let group_id = distribution.group_id.as_str();
        let handle = self.locks.handle(&(group_id.to_string(), sender.clone()));
        let _guard = lock(&handle);

        let now = self.env.now_secs();
        let state = SenderKeyState::new(
            distribution.key_id,
            ChainKey::with_index(distribution.chain_key, distribution.iteration),
            now,
        );

        let installed = match self.store.load_sender_key(group_id, sender)? {
            Some(mut record) => {
                let installed = record.install(state, now);
                if installed {
                    self.store.store_sender_key(&record)?;
                }
                installed
            },
            None => {
                self.store.store_sender_key(&SenderKeyRecord::new(group_id, sender.clone(), state))?;
                true
            },
        };

        if installed {
            info!(group_id, %sender, key_id = distribution.key_id, "installed sender key");
        } else {
            debug!(group_id, %sender, key_id = distribution.key_id, "ignored stale sender key");
        }
        Ok(installed)
    }

    /// Encrypt `plaintext` once for every member of `group_id`.
    pub fn encrypt_group_message(
        &self,
        group_id: &str,
        plaintext: &[u8],
    ) -> Result<GroupMessage, EngineError> {
        let handle = self.locks.handle(&(group_id.to_string(), self.local.clone()));
        let _guard = lock(&handle);

        let mut record = self.own_record(group_id)?;
        let iteration = record.current.chain.index();
        let message_key = record.current.chain.advance()?;

        let mut message = GroupMessage {
            group_id: group_id.to_string(),
            key_id: record.current.key_id,
            iteration,
            nonce: build_nonce(iteration, self.env.random_array()?),
            ciphertext: Vec::new(),
        };
        message.ciphertext =
            seal(message_key.key(), &message.nonce, plaintext, &message.associated_data());

        self.store.store_sender_key(&record)?;
        Ok(message)
    }

    /// Decrypt a group message from `sender`.
    ///
    /// Fails with [`EngineError::UnknownSenderKey`] if the generation was
    /// never received or has been purged. On any error the stored key is
    /// unchanged.
    pub fn decrypt_group_message(
        &self,
        sender: &PeerAddress,
        message: &GroupMessage,
    ) -> Result<Vec<u8>, EngineError> {
        let handle = self.locks.handle(&(message.group_id.clone(), sender.clone()));
        let _guard = lock(&handle);

        let unknown = || EngineError::UnknownSenderKey {
            group_id: message.group_id.clone(),
            key_id: message.key_id,
        };

        let now = self.env.now_secs();
        let mut record = self.store.load_sender_key(&message.group_id, sender)?.ok_or_else(unknown)?;
        let state = record
            .state_mut(message.key_id, now, self.config.sender_key_grace.as_secs())
            .ok_or_else(unknown)?;

        let message_key =
            state.message_key(message.iteration, now, self.config.max_skip, &self.config.skipped_keys)?;
        let plaintext = open(
            message_key.key(),
            &message.nonce,
            &message.ciphertext,
            &message.associated_data(),
        )?;

        self.store.store_sender_key(&record)?;
        Ok(plaintext)
    }

    /// Forget `removed`'s key and rotate ours for the `remaining` members.
    pub fn handle_member_removed(
        &self,
        group_id: &str,
        removed: &PeerAddress,
        remaining: &[PeerAddress],
    ) -> Result<Vec<(PeerAddress, Envelope)>, EngineError> {
        {
            let handle = self.locks.handle(&(group_id.to_string(), removed.clone()));
            let _guard = lock(&handle);
            self.store.delete_sender_key(group_id, removed)?;
        }

        info!(group_id, %removed, "member removed; rotating sender key");
        self.create_sender_key(group_id, remaining)
    }

    /// Erase retired sender keys past their grace period. Returns how many
    /// were erased.
    pub fn purge_retired(&self) -> Result<usize, EngineError> {
        let now = self.env.now_secs();
        let grace = self.config.sender_key_grace.as_secs();
        let mut purged = 0;

        for listed in self.store.list_sender_keys()? {
            let handle = self.locks.handle(&(listed.group_id.clone(), listed.sender.clone()));
            let _guard = lock(&handle);

            if let Some(mut record) = self.store.load_sender_key(&listed.group_id, &listed.sender)? {
                let count = record.purge_retired(now, grace);
                if count > 0 {
                    self.store.store_sender_key(&record)?;
                    purged += count;
                }
            }
        }

        if purged > 0 {
            debug!(purged, "purged retired sender keys");
        }
        Ok(purged)
    }

    fn own_record(&self, group_id: &str) -> Result<SenderKeyRecord, EngineError> {
        self.store
            .load_sender_key(group_id, &self.local)?
            .ok_or_else(|| EngineError::UnknownSenderKey { group_id: group_id.to_string(), key_id: 0 })
    }

    fn distribute(
        &self,
        group_id: &str,
        state: &SenderKeyState,
        members: &[PeerAddress],
    ) -> Result<Vec<(PeerAddress, Envelope)>, EngineError> {
        let payload = Zeroizing::new(state.distribution(group_id).encode()?);

        let mut envelopes = Vec::with_capacity(members.len());
        for member in members.iter().filter(|member| **member != self.local) {
            envelopes.push((member.clone(), self.sessions.encrypt(member, &payload)?));
        }
        Ok(envelopes)
    }
}
