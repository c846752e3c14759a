//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Default bound on message keys derived ahead of a chain in one step
pub const DEFAULT_MAX_SKIP: u32 = 1000;

/// Default cap on cached skipped message keys per session
pub const DEFAULT_MAX_SKIPPED_KEYS: usize = 1000;

/// Default retention for cached skipped message keys
pub const DEFAULT_SKIPPED_KEY_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default signed pre-key rotation interval
pub const DEFAULT_SIGNED_PRE_KEY_ROTATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default time a superseded signed pre-key keeps accepting sessions
pub const DEFAULT_SIGNED_PRE_KEY_GRACE: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// Default number of one-time pre-keys per upload
pub const DEFAULT_ONE_TIME_BATCH: u32 = 100;

/// Default unused one-time pre-key count that triggers replenishment
pub const DEFAULT_ONE_TIME_LOW_WATER: u32 = 20;

/// Default time a retired sender key still decrypts in-flight messages
pub const DEFAULT_SENDER_KEY_GRACE: Duration = Duration::from_secs(2 * 24 * 60 * 60);

/// Default consecutive out-of-window failures before a session is reported
/// desynchronized
pub const DEFAULT_DESYNC_THRESHOLD: u32 = 3;

/// Default furthest a chain is derived to check whether an out-of-window
/// message is genuine
pub const DEFAULT_DESYNC_WINDOW: u32 = 10_000;

/// Smallest one-time pre-key upload a key directory accepts
pub const MIN_ONE_TIME_UPLOAD: usize = 20;

/// Largest one-time pre-key upload a key directory accepts
pub const MAX_ONE_TIME_UPLOAD: usize = 100;

/// Retention policy for skipped message keys.
///
/// Both limits apply: the oldest entries are evicted past `max_entries`, and
/// entries older than `max_age` are purged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedKeyPolicy {
    /// Maximum cached keys per session or sender key
    pub max_entries: usize,
    /// Maximum age of a cached key
    pub max_age: Duration,
}

impl Default for SkippedKeyPolicy {
    fn default() -> Self {
        Self { max_entries: DEFAULT_MAX_SKIPPED_KEYS, max_age: DEFAULT_SKIPPED_KEY_MAX_AGE }
    }
}

/// Pre-key lifecycle policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyPolicy {
    /// Age after which the signed pre-key is replaced
    pub rotation_interval: Duration,
    /// How long a superseded signed pre-key still completes handshakes
    pub grace_period: Duration,
    /// One-time pre-keys generated per batch
    pub batch_size: u32,
    /// Unused count below which a new batch is generated
    pub low_water_mark: u32,
}

impl Default for PreKeyPolicy {
    fn default() -> Self {
        Self {
            rotation_interval: DEFAULT_SIGNED_PRE_KEY_ROTATION,
            grace_period: DEFAULT_SIGNED_PRE_KEY_GRACE,
            batch_size: DEFAULT_ONE_TIME_BATCH,
            low_water_mark: DEFAULT_ONE_TIME_LOW_WATER,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bound on keys derived ahead of a chain in one step
    pub max_skip: u32,
    /// Skipped message key retention
    pub skipped_keys: SkippedKeyPolicy,
    /// Pre-key lifecycle
    pub pre_keys: PreKeyPolicy,
    /// How long retired sender keys keep decrypting
    pub sender_key_grace: Duration,
    /// Consecutive authenticated out-of-window messages before reporting
    /// desync
    pub desync_threshold: u32,
    /// Furthest a chain is derived to authenticate an out-of-window message
    pub desync_window: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_skip: DEFAULT_MAX_SKIP,
            skipped_keys: SkippedKeyPolicy::default(),
            pre_keys: PreKeyPolicy::default(),
            sender_key_grace: DEFAULT_SENDER_KEY_GRACE,
            desync_threshold: DEFAULT_DESYNC_THRESHOLD,
            desync_window: DEFAULT_DESYNC_WINDOW,
        }
    }
}

impl EngineConfig {
    /// Check the settings against each other and the directory limits.
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |reason: &str| Err(EngineError::InvalidConfig { reason: reason.to_string() });

        if self.max_skip == 0 {
            return invalid("max_skip must be positive");
        }
        if self.skipped_keys.max_entries == 0 {
            return invalid("skipped key cache must hold at least one entry");
        }
        let batch = self.pre_keys.batch_size as usize;
        if !(MIN_ONE_TIME_UPLOAD..=MAX_ONE_TIME_UPLOAD).contains(&batch) {
            return invalid("one-time pre-key batch must be between 20 and 100");
        }
        if self.pre_keys.low_water_mark >= self.pre_keys.batch_size {
            return invalid("low-water mark must be below the batch size");
        }
        if self.pre_keys.rotation_interval < DAY {
            return invalid("signed pre-key rotation interval must be at least a day");
        }
        if self.desync_threshold == 0 {
            return invalid("desync threshold must be positive");
        }
        if self.desync_window <= self.max_skip {
            return invalid("desync window must exceed max_skip");
        }
        Ok(())
    }
}
