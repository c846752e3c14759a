//! Extensions carried in the initial message.
//!
//! Receivers ignore extensions they do not act on. `Opaque` keeps unknown
//! tags intact so newer peers can add fields without breaking older ones.

use serde::{Deserialize, Serialize};

/// Optional data attached to an [`crate::InitialMessage`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Extension {
    /// Header versions the initiator can parse
    SupportedVersions(Vec<u8>),
    /// Human-readable label of the initiating device
    DeviceLabel(String),
    /// Extension this build has no type for
    Opaque {
        /// Extension tag
        tag: u16,
        /// Raw extension body
        data: Vec<u8>,
    },
}

impl Extension {
    /// Numeric tag identifying the extension kind.
    pub fn tag(&self) -> u16 {
        match self {
            Self::SupportedVersions(_) => 1,
            Self::DeviceLabel(_) => 2,
            Self::Opaque { tag, .. } => *tag,
        }
    }
}
