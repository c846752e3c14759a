//! Persistent state of one pairwise session.
//!
//! A [`Session`] is created by X3DH and advanced by the
//! [`RatchetEngine`](crate::ratchet::RatchetEngine). It is plain data: every
//! field round-trips through the key store.

use std::fmt;

use hushline_crypto::{ChainKey, IdentityKey, KeyPair, PublicKey, RootKey};
use hushline_proto::{InitialMessage, MessageHeader};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{skipped::SkippedKeyCache, x3dh::Agreement};

/// Base keys of replaced handshakes remembered per peer.
pub const MAX_PREVIOUS_BASE_KEYS: usize = 32;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// X3DH complete; no DH ratchet step yet
    Established,
    /// At least one DH ratchet step has happened
    Ratcheting,
    /// Keys destroyed; no further use
    Closed,
}

/// Double Ratchet state with one peer device.
#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    pub(crate) state: SessionState,
    pub(crate) remote_identity: IdentityKey,
    /// `IK_initiator || IK_responder`, prefixed to every header as AD
    pub(crate) associated_data: Vec<u8>,
    pub(crate) root_key: RootKey,
    pub(crate) local_ratchet: Option<KeyPair>,
    pub(crate) remote_ratchet: Option<PublicKey>,
    pub(crate) sending_chain: Option<ChainKey>,
    pub(crate) receiving_chain: Option<ChainKey>,
    pub(crate) previous_counter: u32,
    pub(crate) skipped: SkippedKeyCache<(PublicKey, u32)>,
    /// Repeated on outgoing messages until the peer first replies
    pub(crate) pending_initial: Option<InitialMessage>,
    /// Initiator's ephemeral key; identifies the handshake
    pub(crate) base_key: PublicKey,
    /// Base keys of earlier handshakes with this peer, newest last
    #[serde(default)]
    pub(crate) previous_base_keys: Vec<PublicKey>,
    pub(crate) created_at: u64,
    pub(crate) last_activity: u64,
}

impl Session {
    /// Session for the party that ran X3DH against a bundle.
    ///
    /// The ephemeral key doubles as the first ratchet key and the first
    /// chain from X3DH is the sending chain.
    pub(crate) fn initiator(
        agreement: Agreement,
        remote_identity: IdentityKey,
        ephemeral: KeyPair,
        initial: InitialMessage,
        now: u64,
    ) -> Self {
        let Agreement { root_key, chain_key, associated_data } = agreement;
        Self {
            state: SessionState::Established,
            remote_identity,
            associated_data,
            root_key,
            base_key: ephemeral.public_key(),
            local_ratchet: Some(ephemeral),
            remote_ratchet: None,
            sending_chain: Some(chain_key),
            receiving_chain: None,
            previous_counter: 0,
            skipped: SkippedKeyCache::new(),
            pending_initial: Some(initial),
            previous_base_keys: Vec::new(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Session for the party that answered an initial message.
    ///
    /// The first chain from X3DH receives under the initiator's ephemeral
    /// key. The sending chain is created by a DH step on first send.
    pub(crate) fn responder(
        agreement: Agreement,
        remote_identity: IdentityKey,
        base_key: PublicKey,
        now: u64,
    ) -> Self {
        let Agreement { root_key, chain_key, associated_data } = agreement;
        Self {
            state: SessionState::Established,
            remote_identity,
            associated_data,
            root_key,
            base_key,
            local_ratchet: None,
            remote_ratchet: Some(base_key),
            sending_chain: None,
            receiving_chain: Some(chain_key),
            previous_counter: 0,
            skipped: SkippedKeyCache::new(),
            pending_initial: None,
            previous_base_keys: Vec::new(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Peer's identity key as authenticated by X3DH.
    pub fn remote_identity(&self) -> IdentityKey {
        self.remote_identity
    }

    /// Current root key.
    pub fn root_key(&self) -> &RootKey {
        &self.root_key
    }

    /// Initiator's ephemeral key from the handshake.
    pub fn base_key(&self) -> PublicKey {
        self.base_key
    }

    /// Our current ratchet public key, once we have one.
    pub fn local_ratchet_key(&self) -> Option<PublicKey> {
        self.local_ratchet.as_ref().map(KeyPair::public_key)
    }

    /// Peer's current ratchet public key, once known.
    pub fn remote_ratchet_key(&self) -> Option<PublicKey> {
        self.remote_ratchet
    }

    /// Index of the next outgoing message on the current sending chain.
    pub fn sending_index(&self) -> Option<u32> {
        self.sending_chain.as_ref().map(ChainKey::index)
    }

    /// Index of the next expected message on the current receiving chain.
    pub fn receiving_index(&self) -> Option<u32> {
        self.receiving_chain.as_ref().map(ChainKey::index)
    }

    /// Length of our previous sending chain.
    pub fn previous_counter(&self) -> u32 {
        self.previous_counter
    }

    /// Number of cached skipped message keys.
    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    /// Whether outgoing messages still carry the X3DH initial message.
    pub fn pending_initial(&self) -> Option<&InitialMessage> {
        self.pending_initial.as_ref()
    }

    /// Creation time (seconds since the Unix epoch).
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Time of the last successful encrypt or decrypt.
    pub fn last_activity(&self) -> u64 {
        self.last_activity
    }

    /// Whether the handshake identified by `base_key` was this session's or
    /// one it replaced.
    pub fn has_accepted(&self, base_key: &PublicKey) -> bool {
        self.base_key == *base_key || self.previous_base_keys.contains(base_key)
    }

    /// Carry the handshake history of `previous`, which this session
    /// replaces, so its handshake can never be replayed over this one.
    pub(crate) fn inherit_history(&mut self, previous: &Session) {
        let mut keys = previous.previous_base_keys.clone();
        keys.push(previous.base_key);
        keys.retain(|key| *key != self.base_key);
        keys.dedup();
        let excess = keys.len().saturating_sub(MAX_PREVIOUS_BASE_KEYS);
        keys.drain(..excess);
        self.previous_base_keys = keys;
    }

    /// Associated data for one message: session AD followed by the encoded
    /// header.
    pub(crate) fn associated_data_for(&self, header: &MessageHeader) -> Vec<u8> {
        let mut ad = Vec::with_capacity(self.associated_data.len() + MessageHeader::SIZE);
        ad.extend_from_slice(&self.associated_data);
        ad.extend_from_slice(&header.to_bytes());
        ad
    }

    /// Destroy all key material and mark the session closed.
    pub fn close(&mut self) {
        self.root_key.zeroize();
        self.local_ratchet = None;
        self.sending_chain = None;
        self.receiving_chain = None;
        self.skipped.clear();
        self.pending_initial = None;
        self.state = SessionState::Closed;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("remote_identity", &self.remote_identity)
            .field("sending_index", &self.sending_index())
            .field("receiving_index", &self.receiving_index())
            .field("skipped", &self.skipped.len())
            .field("pending_initial", &self.pending_initial.is_some())
            .finish_non_exhaustive()
    }
}
