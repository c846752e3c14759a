//! Long-term device identity.

use hushline_crypto::{IdentityKey, IdentityKeyPair};
use tracing::info;

use crate::{env::Environment, error::EngineError, store::KeyStore};

/// Creates and loads the device identity key pair.
#[derive(Clone)]
pub struct IdentityManager<S: KeyStore, E: Environment> {
    store: S,
    env: E,
}

impl<S: KeyStore, E: Environment> IdentityManager<S, E> {
    /// Create a manager over `store`.
    pub fn new(store: S, env: E) -> Self {
        Self { store, env }
    }

    /// Return the stored identity, generating one on first call.
    ///
    /// Idempotent, including under concurrent callers: the store keeps the
    /// first identity written and every caller gets that one back.
    pub fn generate_identity(&self) -> Result<IdentityKeyPair, EngineError> {
        if let Some(identity) = self.store.load_identity()? {
            return Ok(identity);
        }

        let candidate = IdentityKeyPair::from_seed(self.env.random_array()?);
        let identity = self.store.initialize_identity(&candidate)?;
        if identity == candidate {
            info!(identity = ?identity.public_key(), "generated identity key");
        }
        Ok(identity)
    }

    /// The stored identity.
    pub fn identity(&self) -> Result<IdentityKeyPair, EngineError> {
        self.store.load_identity()?.ok_or(EngineError::IdentityNotInitialized)
    }

    /// Public half of the stored identity.
    pub fn public_identity(&self) -> Result<IdentityKey, EngineError> {
        Ok(self.identity()?.public_key())
    }
}
