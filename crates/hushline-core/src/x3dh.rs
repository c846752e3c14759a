//! X3DH key agreement.
//!
//! # Agreements
//!
//! ```text
//! DH1 = DH(IK_initiator, SPK_responder)
//! DH2 = DH(EK_initiator, IK_responder)
//! DH3 = DH(EK_initiator, SPK_responder)
//! DH4 = DH(EK_initiator, OPK_responder)    (only if the bundle had one)
//!
//! SK                   = HKDF(0xFF*32 || DH1 || DH2 || DH3 [|| DH4])
//! (root_key, chain_0)  = HKDF(SK, "hushlineSessionV1")
//! associated_data      = IK_initiator || IK_responder
//! ```
//!
//! Identity keys are Ed25519; the identity legs use their X25519 form.
//!
//! # Responder commit
//!
//! [`SessionEstablisher::derive_response`] reconstructs the session without
//! touching the store. The caller authenticates the first ciphertext with
//! it, then [`SessionEstablisher::commit_response`] consumes the one-time
//! pre-key. A forged initial message therefore never burns a one-time
//! pre-key, and two racing handshakes on the same key cannot both commit.

use hushline_crypto::{
    ChainKey, CryptoError, DhOutput, IdentityKeyPair, KeyPair, RootKey, derive_session_keys,
    derive_x3dh_secret,
};
use hushline_proto::{Extension, InitialMessage};
use tracing::{debug, info};

use crate::{
    config::PreKeyPolicy, env::Environment, error::EngineError, prekeys::PreKeyBundle,
    session::Session, store::KeyStore,
};

fn establishment_failed(reason: &str) -> EngineError {
    EngineError::SessionEstablishmentFailed { reason: reason.to_string() }
}

fn invalid_handshake_key(_: CryptoError) -> EngineError {
    establishment_failed("handshake key yields no valid agreement")
}

/// Keys both parties derive from one handshake.
pub struct Agreement {
    pub(crate) root_key: RootKey,
    pub(crate) chain_key: ChainKey,
    pub(crate) associated_data: Vec<u8>,
}

impl Agreement {
    fn derive(agreements: &[DhOutput], associated_data: Vec<u8>) -> Self {
        let shared = derive_x3dh_secret(agreements);
        let (root_key, chain_key) = derive_session_keys(&shared);
        Self { root_key, chain_key, associated_data }
    }

    /// Initial root key.
    pub fn root_key(&self) -> &RootKey {
        &self.root_key
    }

    /// First chain: the initiator sends on it, the responder receives.
    pub fn chain_key(&self) -> &ChainKey {
        &self.chain_key
    }

    /// `IK_initiator || IK_responder`.
    pub fn associated_data(&self) -> &[u8] {
        &self.associated_data
    }
}

/// Initiator half of X3DH against a fetched bundle.
///
/// The bundle's signed pre-key signature is verified first; an invalid
/// signature fails with [`EngineError::SignatureVerificationFailed`] before
/// any agreement is computed.
pub fn agree_as_initiator(
    identity: &IdentityKeyPair,
    ephemeral: &KeyPair,
    bundle: &PreKeyBundle,
) -> Result<Agreement, EngineError> {
    bundle.verify()?;

    let remote_identity = bundle.identity_key.agreement_key().map_err(invalid_handshake_key)?;
    let signed_pre_key = bundle.signed_pre_key.public_key;

    let mut agreements = vec![
        identity.diffie_hellman(&signed_pre_key).map_err(invalid_handshake_key)?,
        ephemeral.diffie_hellman(&remote_identity).map_err(invalid_handshake_key)?,
        ephemeral.diffie_hellman(&signed_pre_key).map_err(invalid_handshake_key)?,
    ];
    if let Some(one_time) = &bundle.one_time_pre_key {
        agreements.push(
            ephemeral.diffie_hellman(&one_time.public_key).map_err(invalid_handshake_key)?,
        );
    }

    let mut associated_data = identity.public_key().as_bytes().to_vec();
    associated_data.extend_from_slice(bundle.identity_key.as_bytes());

    Ok(Agreement::derive(&agreements, associated_data))
}

/// Responder half of X3DH, mirroring [`agree_as_initiator`].
pub fn agree_as_responder(
    identity: &IdentityKeyPair,
    signed_pre_key: &KeyPair,
    one_time_pre_key: Option<&KeyPair>,
    initial: &InitialMessage,
) -> Result<Agreement, EngineError> {
    let remote_identity = initial.identity_key.agreement_key().map_err(invalid_handshake_key)?;
    let ephemeral = initial.ephemeral_key;

    let mut agreements = vec![
        signed_pre_key.diffie_hellman(&remote_identity).map_err(invalid_handshake_key)?,
        identity.diffie_hellman(&ephemeral).map_err(invalid_handshake_key)?,
        signed_pre_key.diffie_hellman(&ephemeral).map_err(invalid_handshake_key)?,
    ];
    if let Some(one_time) = one_time_pre_key {
        agreements.push(one_time.diffie_hellman(&ephemeral).map_err(invalid_handshake_key)?);
    }

    let mut associated_data = initial.identity_key.as_bytes().to_vec();
    associated_data.extend_from_slice(identity.public_key().as_bytes());

    Ok(Agreement::derive(&agreements, associated_data))
}

/// Responder session derived but not yet committed.
#[derive(Debug)]
pub struct PendingResponse {
    session: Session,
    one_time_pre_key_id: Option<u32>,
}

impl PendingResponse {
    /// The derived session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Mutable access, for decrypting the first message before commit.
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// One-time pre-key the commit will consume.
    pub fn one_time_pre_key_id(&self) -> Option<u32> {
        self.one_time_pre_key_id
    }

    /// Take the session.
    pub fn into_session(self) -> Session {
        self.session
    }
}

/// Runs X3DH against local key material in a [`KeyStore`].
#[derive(Clone)]
pub struct SessionEstablisher<S: KeyStore, E: Environment> {
    store: S,
    env: E,
    policy: PreKeyPolicy,
}

impl<S: KeyStore, E: Environment> SessionEstablisher<S, E> {
    /// Create an establisher. `policy` decides how long superseded signed
    /// pre-keys keep answering handshakes.
    pub fn new(store: S, env: E, policy: PreKeyPolicy) -> Self {
        Self { store, env, policy }
    }

    /// Start a session against `bundle` with a fresh ephemeral key.
    pub fn initiate(&self, bundle: &PreKeyBundle) -> Result<Session, EngineError> {
        self.initiate_with_extensions(bundle, Vec::new())
    }

    /// [`initiate`](Self::initiate), attaching `extensions` to the initial
    /// message.
    pub fn initiate_with_extensions(
        &self,
        bundle: &PreKeyBundle,
        extensions: Vec<Extension>,
    ) -> Result<Session, EngineError> {
        let identity = self.store.load_identity()?.ok_or(EngineError::IdentityNotInitialized)?;
        let ephemeral = KeyPair::from_random(self.env.random_array()?);

        let agreement = agree_as_initiator(&identity, &ephemeral, bundle)?;

        let initial = InitialMessage {
            identity_key: identity.public_key(),
            ephemeral_key: ephemeral.public_key(),
            signed_pre_key_id: bundle.signed_pre_key.key_id,
            one_time_pre_key_id: bundle.one_time_pre_key.map(|key| key.key_id),
            extensions,
        };

        debug!(
            signed_pre_key_id = initial.signed_pre_key_id,
            one_time_pre_key_id = ?initial.one_time_pre_key_id,
            "initiated session"
        );
        Ok(Session::initiator(
            agreement,
            bundle.identity_key,
            ephemeral,
            initial,
            self.env.now_secs(),
        ))
    }

    /// Reconstruct the initiator's session from its initial message.
    ///
    /// Reads key material only. Fails with
    /// [`EngineError::SessionEstablishmentFailed`] if the signed pre-key is
    /// unknown or past its grace window, or the one-time pre-key is unknown
    /// or already consumed; the initiator should fetch a fresh bundle.
    pub fn derive_response(&self, initial: &InitialMessage) -> Result<PendingResponse, EngineError> {
        let identity = self.store.load_identity()?.ok_or(EngineError::IdentityNotInitialized)?;
        let now = self.env.now_secs();

        let signed_pre_key = self
            .store
            .load_signed_pre_key(initial.signed_pre_key_id)?
            .filter(|key| !key.is_expired(now, &self.policy))
            .ok_or_else(|| establishment_failed("unknown or expired signed pre-key"))?;

        let one_time_pre_key = match initial.one_time_pre_key_id {
            Some(key_id) => Some(
                self.store
                    .load_one_time_pre_key(key_id)?
                    .and_then(|key| key.key_pair())
                    .ok_or_else(|| establishment_failed("one-time pre-key unavailable"))?,
            ),
            None => None,
        };

        let agreement = agree_as_responder(
            &identity,
            signed_pre_key.key_pair(),
            one_time_pre_key.as_ref(),
            initial,
        )?;

        Ok(PendingResponse {
            session: Session::responder(
                agreement,
                initial.identity_key,
                initial.ephemeral_key,
                now,
            ),
            one_time_pre_key_id: initial.one_time_pre_key_id,
        })
    }

    /// Atomically consume the one-time pre-key behind `pending`.
    ///
    /// Exactly one of several racing commits for the same key succeeds.
    pub fn commit_response(&self, pending: &PendingResponse) -> Result<(), EngineError> {
        if let Some(key_id) = pending.one_time_pre_key_id
            && !self.store.consume_one_time_pre_key(key_id)?
        {
            return Err(establishment_failed("one-time pre-key already consumed"));
        }

        info!(one_time_pre_key_id = ?pending.one_time_pre_key_id, "accepted session");
        Ok(())
    }

    /// Derive and commit in one step, without authenticating a first
    /// message.
    pub fn respond(&self, initial: &InitialMessage) -> Result<Session, EngineError> {
        let pending = self.derive_response(initial)?;
        self.commit_response(&pending)?;
        Ok(pending.into_session())
    }
}
