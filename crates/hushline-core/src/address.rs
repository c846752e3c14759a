//! Addressing of remote devices.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Device id used when a peer has a single device.
pub const DEFAULT_DEVICE_ID: u32 = 1;

/// A remote user's device. Sessions and sender keys are keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    user_id: String,
    device_id: u32,
}

impl PeerAddress {
    /// Address a specific device of `user_id`.
    pub fn new(user_id: impl Into<String>, device_id: u32) -> Self {
        Self { user_id: user_id.into(), device_id }
    }

    /// Address the default device of `user_id`.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self::new(user_id, DEFAULT_DEVICE_ID)
    }

    /// User identifier.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Device identifier.
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Stable byte key for ordered stores: `device_id (BE) || user_id`.
    pub fn storage_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(4 + self.user_id.len());
        key.extend_from_slice(&self.device_id.to_be_bytes());
        key.extend_from_slice(self.user_id.as_bytes());
        key
    }

    /// Inverse of [`storage_key`](Self::storage_key).
    pub fn from_storage_key(bytes: &[u8]) -> Option<Self> {
        let (device, user) = bytes.split_first_chunk::<4>()?;
        let user_id = std::str::from_utf8(user).ok()?;
        Some(Self::new(user_id, u32::from_be_bytes(*device)))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.user_id, self.device_id)
    }
}
