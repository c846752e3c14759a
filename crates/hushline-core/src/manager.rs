//! Transactional session access.
//!
//! Every operation on a peer's session runs as one unit under that peer's
//! lock: load the record, run the ratchet on it, persist the result, and
//! only then hand the output to the caller. If persisting fails the caller
//! gets the error and nothing to send, so a message key is never used
//! without the advanced chain being durable.

#![allow(clippy::disallowed_types, reason = "Desync counters are process-local")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use hushline_proto::{Envelope, Extension, InitialMessage, RatchetMessage};
use tracing::{debug, info, warn};

use crate::{
    address::PeerAddress,
    config::EngineConfig,
    env::Environment,
    error::{DecryptFailure, EngineError},
    locks::{KeyedLocks, lock},
    prekeys::PreKeyBundle,
    ratchet::RatchetEngine,
    session::{Session, SessionState},
    store::KeyStore,
    x3dh::SessionEstablisher,
};

/// Owns every pairwise session on this device.
#[derive(Clone)]
pub struct SessionManager<S: KeyStore, E: Environment> {
    store: S,
    env: E,
    config: EngineConfig,
    establisher: SessionEstablisher<S, E>,
    engine: RatchetEngine<E>,
    locks: KeyedLocks<PeerAddress>,
    /// Consecutive too-far-ahead failures per peer
    desync: Arc<Mutex<HashMap<PeerAddress, u32>>>,
}

impl<S: KeyStore, E: Environment> SessionManager<S, E> {
    /// Create a manager. Fails if `config` is inconsistent.
    pub fn new(store: S, env: E, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            establisher: SessionEstablisher::new(store.clone(), env.clone(), config.pre_keys.clone()),
            engine: RatchetEngine::new(env.clone(), &config),
            store,
            env,
            config,
            locks: KeyedLocks::new(),
            desync: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Underlying key store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Environment.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run X3DH against `bundle` and store the new session with `peer`,
    /// replacing any previous one. Handshakes the old session remembered
    /// stay rejected.
    pub fn start_session(&self, peer: &PeerAddress, bundle: &PreKeyBundle) -> Result<(), EngineError> {
        self.start_session_with_extensions(peer, bundle, Vec::new())
    }

    /// [`start_session`](Self::start_session) with handshake extensions.
    pub fn start_session_with_extensions(
        &self,
        peer: &PeerAddress,
        bundle: &PreKeyBundle,
        extensions: Vec<Extension>,
    ) -> Result<(), EngineError> {
        let mut session = self.establisher.initiate_with_extensions(bundle, extensions)?;

        let handle = self.locks.handle(peer);
        let _guard = lock(&handle);
        if let Some(previous) = self.store.load_session(peer)? {
            session.inherit_history(&previous);
        }
        self.store.store_session(peer, &session)?;
        self.reset_desync(peer);

        info!(%peer, "started session");
        Ok(())
    }

    /// Whether a usable session with `peer` exists.
    pub fn has_session(&self, peer: &PeerAddress) -> Result<bool, EngineError> {
        Ok(self.session_state(peer)?.is_some_and(|state| state != SessionState::Closed))
    }

    /// Lifecycle state of the session with `peer`; `None` if there is none.
    pub fn session_state(&self, peer: &PeerAddress) -> Result<Option<SessionState>, EngineError> {
        Ok(self.store.load_session(peer)?.map(|session| session.state()))
    }

    /// Snapshot of the session with `peer`.
    pub fn load_session(&self, peer: &PeerAddress) -> Result<Option<Session>, EngineError> {
        Ok(self.store.load_session(peer)?)
    }

    /// Every peer with a stored session.
    pub fn list_sessions(&self) -> Result<Vec<PeerAddress>, EngineError> {
        Ok(self.store.list_sessions()?)
    }

    /// Encrypt `plaintext` for `peer`.
    ///
    /// Returns a [`Envelope::PreKey`] until the peer has replied, so a lost
    /// first message does not strand the session.
    pub fn encrypt(&self, peer: &PeerAddress, plaintext: &[u8]) -> Result<Envelope, EngineError> {
        let handle = self.locks.handle(peer);
        let _guard = lock(&handle);

        let mut session =
            self.store.load_session(peer)?.ok_or_else(|| EngineError::NoSession { peer: peer.clone() })?;
        let message = self.engine.encrypt(&mut session, plaintext)?;
        self.store.store_session(peer, &session)?;

        Ok(match session.pending_initial() {
            Some(initial) => Envelope::PreKey { initial: initial.clone(), message },
            None => Envelope::Message(message),
        })
    }

    /// Decrypt an envelope from `peer`.
    ///
    /// A [`Envelope::PreKey`] for an unknown handshake establishes the
    /// responder session; the one-time pre-key is consumed only after the
    /// message authenticates. Repeated pre-key headers for the current
    /// session decrypt on it directly; headers of a handshake this session
    /// replaced fail as [`DecryptFailure::Duplicate`].
    ///
    /// A message too far ahead of the chain counts towards desync only if
    /// it authenticates within `desync_window`. After `desync_threshold`
    /// such messages in a row the error becomes
    /// [`EngineError::RatchetDesynchronized`].
    pub fn decrypt(&self, peer: &PeerAddress, envelope: &Envelope) -> Result<Vec<u8>, EngineError> {
        let handle = self.locks.handle(peer);
        let _guard = lock(&handle);

        let result = match envelope {
            Envelope::PreKey { initial, message } => self.decrypt_pre_key(peer, initial, message),
            Envelope::Message(message) => self.decrypt_message(peer, message),
        };
        self.track_desync(peer, envelope.message(), result)
    }

    /// Destroy the session with `peer`. Returns whether one existed.
    pub fn delete_session(&self, peer: &PeerAddress) -> Result<bool, EngineError> {
        let deleted = {
            let handle = self.locks.handle(peer);
            let _guard = lock(&handle);

            match self.store.load_session(peer)? {
                Some(mut session) => {
                    session.close();
                    self.store.delete_session(peer)?;
                    true
                },
                None => false,
            }
        };

        self.reset_desync(peer);
        self.locks.forget(peer);
        if deleted {
            info!(%peer, "deleted session");
        }
        Ok(deleted)
    }

    fn decrypt_message(
        &self,
        peer: &PeerAddress,
        message: &RatchetMessage,
    ) -> Result<Vec<u8>, EngineError> {
        let mut session =
            self.store.load_session(peer)?.ok_or_else(|| EngineError::NoSession { peer: peer.clone() })?;
        let plaintext = self.engine.decrypt(&mut session, message)?;
        self.store.store_session(peer, &session)?;
        Ok(plaintext)
    }

    fn decrypt_pre_key(
        &self,
        peer: &PeerAddress,
        initial: &InitialMessage,
        message: &RatchetMessage,
    ) -> Result<Vec<u8>, EngineError> {
        match self.store.load_session(peer)? {
            Some(mut session)
                if session.state() != SessionState::Closed
                    && session.base_key() == initial.ephemeral_key =>
            {
                debug!(%peer, "pre-key message for current session");
                let plaintext = self.engine.decrypt(&mut session, message)?;
                self.store.store_session(peer, &session)?;
                Ok(plaintext)
            },
            Some(current)
                if current.state() != SessionState::Closed
                    && current.has_accepted(&initial.ephemeral_key) =>
            {
                debug!(%peer, "pre-key message for a replaced session");
                Err(EngineError::decryption(DecryptFailure::Duplicate))
            },
            existing => {
                let mut pending = self.establisher.derive_response(initial)?;
                let plaintext = self.engine.decrypt(pending.session_mut(), message)?;
                self.establisher.commit_response(&pending)?;

                if let Some(previous) = &existing {
                    if previous.remote_identity() != initial.identity_key {
                        warn!(%peer, "peer identity key changed");
                    }
                    pending.session_mut().inherit_history(previous);
                }
                self.store.store_session(peer, pending.session())?;
                self.reset_desync(peer);

                info!(%peer, "accepted session");
                Ok(plaintext)
            },
        }
    }

    fn track_desync(
        &self,
        peer: &PeerAddress,
        message: &RatchetMessage,
        result: Result<Vec<u8>, EngineError>,
    ) -> Result<Vec<u8>, EngineError> {
        if matches!(result, Err(EngineError::DecryptionFailed { reason: DecryptFailure::TooFarAhead }))
            && !self.authenticates_beyond_window(peer, message)?
        {
            warn!(%peer, counter = message.header.counter, "out-of-window message failed authentication");
            return result;
        }

        let mut counts = self.desync.lock().unwrap_or_else(PoisonError::into_inner);
        match &result {
            Ok(_) => {
                counts.remove(peer);
            },
            Err(EngineError::DecryptionFailed { reason: DecryptFailure::TooFarAhead }) => {
                let count = counts.entry(peer.clone()).or_insert(0);
                *count += 1;
                if *count >= self.config.desync_threshold {
                    warn!(%peer, failures = *count, "ratchet desynchronized");
                    return Err(EngineError::RatchetDesynchronized { peer: peer.clone() });
                }
            },
            Err(EngineError::DecryptionFailed { reason: DecryptFailure::Authentication }) => {
                warn!(%peer, "message failed authentication");
            },
            Err(_) => {},
        }
        result
    }

    fn authenticates_beyond_window(
        &self,
        peer: &PeerAddress,
        message: &RatchetMessage,
    ) -> Result<bool, EngineError> {
        Ok(self
            .store
            .load_session(peer)?
            .is_some_and(|session| self.engine.authenticates_beyond_window(&session, message)))
    }

    fn reset_desync(&self, peer: &PeerAddress) {
        self.desync.lock().unwrap_or_else(PoisonError::into_inner).remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use hushline_crypto::IdentityKeyPair;

    use super::*;
    use crate::{
        env::SimEnv, prekeys::PreKeyManager, session::MAX_PREVIOUS_BASE_KEYS, store::MemoryKeyStore,
    };

    struct Device {
        sessions: SessionManager<MemoryKeyStore, SimEnv>,
        pre_keys: PreKeyManager<MemoryKeyStore, SimEnv>,
        identity: IdentityKeyPair,
    }

    impl Device {
        fn new(seed: u8, env: &SimEnv) -> Self {
            Self::with_config(seed, env, EngineConfig::default())
        }

        fn with_config(seed: u8, env: &SimEnv, config: EngineConfig) -> Self {
            let store = MemoryKeyStore::new();
            let identity =
                store.initialize_identity(&IdentityKeyPair::from_seed([seed; 32])).unwrap();
            Self {
                pre_keys: PreKeyManager::new(store.clone(), env.clone(), config.pre_keys.clone()),
                sessions: SessionManager::new(store, env.clone(), config).unwrap(),
                identity,
            }
        }

        fn bundle(&self) -> PreKeyBundle {
            let signed = match self.pre_keys.current_signed_pre_key().unwrap() {
                Some(key) => key,
                None => self.pre_keys.generate_signed_pre_key(&self.identity).unwrap(),
            };
            let one_time = self.pre_keys.generate_one_time_pre_keys(1).unwrap();
            PreKeyBundle {
                identity_key: self.identity.public_key(),
                signed_pre_key: signed.public(),
                one_time_pre_key: Some(one_time[0].public()),
            }
        }
    }

    fn pair() -> (Device, Device, PeerAddress, PeerAddress) {
        let env = SimEnv::with_seed(1);
        (Device::new(1, &env), Device::new(2, &env), PeerAddress::user("alice"), PeerAddress::user("bob"))
    }

    #[test]
    fn pre_key_header_repeats_until_reply() {
        let (alice, bob, alice_addr, bob_addr) = pair();
        alice.sessions.start_session(&bob_addr, &bob.bundle()).unwrap();

        let first = alice.sessions.encrypt(&bob_addr, b"one").unwrap();
        let second = alice.sessions.encrypt(&bob_addr, b"two").unwrap();
        assert!(first.initial().is_some());
        assert!(second.initial().is_some());

        assert_eq!(bob.sessions.decrypt(&alice_addr, &second).unwrap(), b"two");
        assert_eq!(bob.sessions.decrypt(&alice_addr, &first).unwrap(), b"one");

        let reply = bob.sessions.encrypt(&alice_addr, b"ack").unwrap();
        assert!(reply.initial().is_none());
        alice.sessions.decrypt(&bob_addr, &reply).unwrap();

        let third = alice.sessions.encrypt(&bob_addr, b"three").unwrap();
        assert!(third.initial().is_none());
        assert_eq!(bob.sessions.decrypt(&alice_addr, &third).unwrap(), b"three");
    }

    #[test]
    fn forged_first_message_keeps_one_time_pre_key() {
        let (alice, bob, alice_addr, bob_addr) = pair();
        alice.sessions.start_session(&bob_addr, &bob.bundle()).unwrap();

        let mut envelope = alice.sessions.encrypt(&bob_addr, b"hello").unwrap();
        if let Envelope::PreKey { message, .. } = &mut envelope {
            message.ciphertext[0] ^= 0x80;
        }

        assert_eq!(
            bob.sessions.decrypt(&alice_addr, &envelope).unwrap_err(),
            EngineError::decryption(DecryptFailure::Authentication)
        );
        assert_eq!(bob.pre_keys.unused_one_time_count().unwrap(), 1);
        assert!(!bob.sessions.has_session(&alice_addr).unwrap());
    }

    fn acknowledged(config: &EngineConfig) -> (Device, Device, PeerAddress, PeerAddress) {
        let env = SimEnv::with_seed(1);
        let alice = Device::with_config(1, &env, config.clone());
        let bob = Device::with_config(2, &env, config.clone());
        let (alice_addr, bob_addr) = (PeerAddress::user("alice"), PeerAddress::user("bob"));

        alice.sessions.start_session(&bob_addr, &bob.bundle()).unwrap();
        let hello = alice.sessions.encrypt(&bob_addr, b"hello").unwrap();
        bob.sessions.decrypt(&alice_addr, &hello).unwrap();
        let ack = bob.sessions.encrypt(&alice_addr, b"ack").unwrap();
        alice.sessions.decrypt(&bob_addr, &ack).unwrap();
        (alice, bob, alice_addr, bob_addr)
    }

    #[test]
    fn forged_far_ahead_frames_never_escalate() {
        let (alice, bob, alice_addr, bob_addr) = acknowledged(&EngineConfig::default());

        let mut message = alice.sessions.encrypt(&bob_addr, b"x").unwrap().message().clone();
        message.header.counter = 9_999;
        message.ciphertext.fill(0);
        let junk = Envelope::Message(message);

        let before = bob.sessions.load_session(&alice_addr).unwrap().unwrap();
        for _ in 0..10 {
            assert_eq!(
                bob.sessions.decrypt(&alice_addr, &junk).unwrap_err(),
                EngineError::decryption(DecryptFailure::TooFarAhead)
            );
        }
        let after = bob.sessions.load_session(&alice_addr).unwrap().unwrap();
        assert_eq!(after.receiving_index(), before.receiving_index());
        assert_eq!(after.root_key(), before.root_key());
    }

    #[test]
    fn genuine_far_ahead_messages_escalate_to_desync() {
        let config = EngineConfig { max_skip: 4, desync_window: 64, ..EngineConfig::default() };
        let (alice, bob, alice_addr, bob_addr) = acknowledged(&config);

        let sent: Vec<_> =
            (0..10).map(|_| alice.sessions.encrypt(&bob_addr, b"x").unwrap()).collect();

        for envelope in &sent[6..8] {
            assert_eq!(
                bob.sessions.decrypt(&alice_addr, envelope).unwrap_err(),
                EngineError::decryption(DecryptFailure::TooFarAhead)
            );
        }
        let err = bob.sessions.decrypt(&alice_addr, &sent[8]).unwrap_err();
        assert_eq!(err, EngineError::RatchetDesynchronized { peer: alice_addr.clone() });
        assert!(err.requires_rekey());

        // Nothing was delivered or consumed by the checks
        assert_eq!(bob.sessions.decrypt(&alice_addr, &sent[0]).unwrap(), b"x");
    }

    #[test]
    fn replaced_handshake_history_is_bounded() {
        let (alice, bob, alice_addr, bob_addr) = pair();
        let mut first = None;

        for round in 0..MAX_PREVIOUS_BASE_KEYS + 2 {
            alice.sessions.start_session(&bob_addr, &bob.bundle()).unwrap();
            let hello = alice.sessions.encrypt(&bob_addr, &[round as u8]).unwrap();
            bob.sessions.decrypt(&alice_addr, &hello).unwrap();
            if first.is_none() {
                first = Some(hello);
            }
        }

        let session = bob.sessions.load_session(&alice_addr).unwrap().unwrap();
        assert_eq!(session.previous_base_keys.len(), MAX_PREVIOUS_BASE_KEYS);
        let first = first.unwrap();
        assert!(!session.has_accepted(&first.initial().unwrap().ephemeral_key));
    }

    #[test]
    fn deleted_session_is_gone() {
        let (alice, bob, _, bob_addr) = pair();
        alice.sessions.start_session(&bob_addr, &bob.bundle()).unwrap();

        assert!(alice.sessions.delete_session(&bob_addr).unwrap());
        assert!(!alice.sessions.delete_session(&bob_addr).unwrap());
        assert_eq!(alice.sessions.session_state(&bob_addr).unwrap(), None);
        assert_eq!(
            alice.sessions.encrypt(&bob_addr, b"x").unwrap_err(),
            EngineError::NoSession { peer: bob_addr }
        );
    }

    #[test]
    fn new_handshake_replaces_old_session() {
        let (alice, bob, alice_addr, bob_addr) = pair();
        alice.sessions.start_session(&bob_addr, &bob.bundle()).unwrap();
        let first = alice.sessions.encrypt(&bob_addr, b"first").unwrap();
        bob.sessions.decrypt(&alice_addr, &first).unwrap();

        alice.sessions.start_session(&bob_addr, &bob.bundle()).unwrap();
        let again = alice.sessions.encrypt(&bob_addr, b"again").unwrap();
        assert_eq!(bob.sessions.decrypt(&alice_addr, &again).unwrap(), b"again");

        let reply = bob.sessions.encrypt(&alice_addr, b"reply").unwrap();
        assert_eq!(alice.sessions.decrypt(&bob_addr, &reply).unwrap(), b"reply");
    }
}
