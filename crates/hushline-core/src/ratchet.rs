//! Double Ratchet encrypt/decrypt state machine.
//!
//! # Steps
//!
//! ```text
//! send:    [no sending chain] DH step: fresh key pair,
//!                               (root, send) = KDF_RK(root, DH(new, remote))
//!          message key = send.advance()
//!
//! receive: [header key != remote] cache old receiving chain up to
//!                                 previous_counter, then
//!            (root, recv) = KDF_RK(root, DH(local, header key))
//!            (root, send) = KDF_RK(root, DH(fresh, header key))
//!          cache keys up to header.counter, message key = recv.advance()
//! ```
//!
//! Both operations run on a copy of the session and write it back only on
//! success. A forged, replayed or truncated message leaves the session
//! exactly as it was.

use hushline_crypto::{KeyPair, build_nonce, open, seal};
use hushline_proto::{MessageHeader, RatchetMessage};
use tracing::{debug, trace};

use crate::{
    config::{EngineConfig, SkippedKeyPolicy},
    env::Environment,
    error::{DecryptFailure, EngineError},
    session::{Session, SessionState},
    skipped::Lookup,
};

/// Pairwise encrypt/decrypt over [`Session`] records.
///
/// Stateless apart from configuration; callers serialize access to each
/// session (see [`SessionManager`](crate::manager::SessionManager)).
#[derive(Clone)]
pub struct RatchetEngine<E: Environment> {
    env: E,
    max_skip: u32,
    desync_window: u32,
    skipped_policy: SkippedKeyPolicy,
}

impl<E: Environment> RatchetEngine<E> {
    /// Engine using `config`'s skip bound and skipped-key retention.
    pub fn new(env: E, config: &EngineConfig) -> Self {
        Self {
            env,
            max_skip: config.max_skip,
            desync_window: config.desync_window,
            skipped_policy: config.skipped_keys.clone(),
        }
    }

    /// Encrypt `plaintext`, advancing the sending chain.
    ///
    /// The chain moves forward before the ciphertext is returned; encrypting
    /// the same plaintext again yields a new message under a new key.
    pub fn encrypt(
        &self,
        session: &mut Session,
        plaintext: &[u8],
    ) -> Result<RatchetMessage, EngineError> {
        if session.state == SessionState::Closed {
            return Err(EngineError::SessionClosed);
        }

        let mut next = session.clone();
        if next.sending_chain.is_none() {
            self.sending_step(&mut next)?;
        }

        let ratchet_key = next
            .local_ratchet
            .as_ref()
            .map(KeyPair::public_key)
            .ok_or(EngineError::InvalidSessionState { reason: "no local ratchet key" })?;
        let chain = next
            .sending_chain
            .as_mut()
            .ok_or(EngineError::InvalidSessionState { reason: "no sending chain" })?;

        let header =
            MessageHeader { ratchet_key, counter: chain.index(), previous_counter: next.previous_counter };
        let message_key = chain.advance()?;
        let nonce = build_nonce(header.counter, self.env.random_array()?);
        let ciphertext =
            seal(message_key.key(), &nonce, plaintext, &next.associated_data_for(&header));

        next.last_activity = self.env.now_secs();
        *session = next;

        trace!(counter = header.counter, "encrypted message");
        Ok(RatchetMessage { header, nonce, ciphertext })
    }

    /// Decrypt `message`.
    ///
    /// Uses a cached key for out-of-order messages, performs a DH step when
    /// the header carries a new ratchet key, and caches keys for any
    /// messages skipped over. Each message key opens exactly one message;
    /// a second delivery fails with [`DecryptFailure::Duplicate`].
    ///
    /// On any error `session` is unchanged.
    pub fn decrypt(
        &self,
        session: &mut Session,
        message: &RatchetMessage,
    ) -> Result<Vec<u8>, EngineError> {
        self.decrypt_within(session, message, self.max_skip)
    }

    /// Whether `message`, rejected as too far ahead, authenticates when the
    /// chain is derived up to the desync window.
    ///
    /// Works on a copy and discards the plaintext: a message this far out
    /// is never delivered, only taken as proof the peer's chain really moved
    /// on. A forger cannot produce one.
    pub fn authenticates_beyond_window(&self, session: &Session, message: &RatchetMessage) -> bool {
        let mut copy = session.clone();
        self.decrypt_within(&mut copy, message, self.desync_window).is_ok()
    }

    fn decrypt_within(
        &self,
        session: &mut Session,
        message: &RatchetMessage,
        max_skip: u32,
    ) -> Result<Vec<u8>, EngineError> {
        if session.state == SessionState::Closed {
            return Err(EngineError::SessionClosed);
        }

        let now = self.env.now_secs();
        let header = &message.header;
        let mut next = session.clone();

        match next.skipped.take(&(header.ratchet_key, header.counter), now, &self.skipped_policy) {
            Lookup::Hit(message_key) => {
                let plaintext = open(
                    message_key.key(),
                    &message.nonce,
                    &message.ciphertext,
                    &next.associated_data_for(header),
                )?;
                debug!(counter = header.counter, "decrypted out-of-order message");
                Self::commit(session, next, now);
                return Ok(plaintext);
            },
            Lookup::Expired => {
                return Err(EngineError::decryption(DecryptFailure::SkippedKeyExpired));
            },
            Lookup::Miss => {},
        }

        if next.remote_ratchet != Some(header.ratchet_key) {
            self.receiving_step(&mut next, header, now, max_skip)?;
        }

        let chain = next
            .receiving_chain
            .as_mut()
            .ok_or(EngineError::decryption(DecryptFailure::NoReceivingChain))?;
        let skipped = chain.skip_to(header.counter, max_skip)?;
        let message_key = chain.advance()?;

        let plaintext = open(
            message_key.key(),
            &message.nonce,
            &message.ciphertext,
            &next.associated_data_for(header),
        )?;

        for key in skipped {
            next.skipped.insert((header.ratchet_key, key.index()), key, now, &self.skipped_policy);
        }
        next.skipped.purge_expired(now, &self.skipped_policy);

        trace!(counter = header.counter, cached = next.skipped.len(), "decrypted message");
        Self::commit(session, next, now);
        Ok(plaintext)
    }

    fn commit(session: &mut Session, mut next: Session, now: u64) {
        // Any authenticated message from the peer proves it holds the session
        next.pending_initial = None;
        next.last_activity = now;
        *session = next;
    }

    /// First send after a receiving step the peer has not seen yet: derive
    /// a sending chain from a fresh key pair.
    fn sending_step(&self, session: &mut Session) -> Result<(), EngineError> {
        let remote = session
            .remote_ratchet
            .ok_or(EngineError::InvalidSessionState { reason: "no remote ratchet key" })?;

        let fresh = KeyPair::from_random(self.env.random_array()?);
        let (root_key, sending_chain) = session.root_key.ratchet(&fresh.diffie_hellman(&remote)?);

        session.root_key = root_key;
        session.sending_chain = Some(sending_chain);
        session.local_ratchet = Some(fresh);
        session.previous_counter = 0;
        session.state = SessionState::Ratcheting;

        debug!("sending chain ratchet step");
        Ok(())
    }

    /// Peer switched ratchet keys: close out the old receiving chain and
    /// derive new receiving and sending chains.
    fn receiving_step(
        &self,
        session: &mut Session,
        header: &MessageHeader,
        now: u64,
        max_skip: u32,
    ) -> Result<(), EngineError> {
        if let (Some(chain), Some(old_remote)) =
            (session.receiving_chain.as_mut(), session.remote_ratchet)
        {
            for key in chain.skip_to(header.previous_counter, max_skip)? {
                session.skipped.insert((old_remote, key.index()), key, now, &self.skipped_policy);
            }
        }

        let local = session
            .local_ratchet
            .as_ref()
            .ok_or(EngineError::decryption(DecryptFailure::NoReceivingChain))?;
        let (root_key, receiving_chain) =
            session.root_key.ratchet(&local.diffie_hellman(&header.ratchet_key)?);

        let fresh = KeyPair::from_random(self.env.random_array()?);
        let (root_key, sending_chain) =
            root_key.ratchet(&fresh.diffie_hellman(&header.ratchet_key)?);

        session.previous_counter = session.sending_chain.as_ref().map_or(0, |chain| chain.index());
        session.root_key = root_key;
        session.receiving_chain = Some(receiving_chain);
        session.sending_chain = Some(sending_chain);
        session.remote_ratchet = Some(header.ratchet_key);
        session.local_ratchet = Some(fresh);
        session.state = SessionState::Ratcheting;

        debug!(previous_counter = header.previous_counter, "receiving chain ratchet step");
        Ok(())
    }
}
