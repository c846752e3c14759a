//! Environment abstraction for deterministic testing.
//!
//! Decouples engine logic from system resources (wall-clock time, entropy).
//! Production uses [`SystemEnv`]; tests and simulations use [`SimEnv`] with a
//! manual clock and a seeded RNG so every run is reproducible.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use rand_chacha::{
    ChaCha20Rng,
    rand_core::{RngCore, SeedableRng},
};

use crate::error::EngineError;

/// Source of time and randomness.
///
/// # Invariants
///
/// - `now_secs()` never goes backwards within one execution
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current wall-clock time as seconds since the Unix epoch.
    fn now_secs(&self) -> u64;

    /// Fill `buffer` with random bytes.
    ///
    /// Fails with [`EngineError::KeyGenerationFailed`] if the entropy source
    /// is unavailable.
    fn random_bytes(&self, buffer: &mut [u8]) -> Result<(), EngineError>;

    /// Random fixed-size array.
    fn random_array<const N: usize>(&self) -> Result<[u8; N], EngineError> {
        let mut bytes = [0u8; N];
        self.random_bytes(&mut bytes)?;
        Ok(bytes)
    }
}

/// Production environment: system clock and OS entropy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::disallowed_methods)]
    fn now_secs(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs())
    }

    fn random_bytes(&self, buffer: &mut [u8]) -> Result<(), EngineError> {
        getrandom::fill(buffer)
            .map_err(|e| EngineError::KeyGenerationFailed { reason: e.to_string() })
    }
}

/// Simulation environment: manual clock and seeded `ChaCha20` RNG.
///
/// Clones share the clock and the RNG stream.
#[derive(Clone)]
pub struct SimEnv {
    clock: Arc<AtomicU64>,
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl SimEnv {
    /// Clock starts at an arbitrary fixed instant (2024-01-01T00:00:00Z).
    pub const START_SECS: u64 = 1_704_067_200;

    /// Create an environment whose byte stream is fixed by `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            clock: Arc::new(AtomicU64::new(Self::START_SECS)),
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.clock.fetch_add(by.as_secs(), Ordering::SeqCst);
    }

    /// Set the clock. Ignored if it would move time backwards.
    pub fn set_now(&self, secs: u64) {
        self.clock.fetch_max(secs, Ordering::SeqCst);
    }
}

impl Environment for SimEnv {
    fn now_secs(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) -> Result<(), EngineError> {
        self.rng.lock().expect("SimEnv RNG mutex poisoned").fill_bytes(buffer);
        Ok(())
    }
}
