//! Hushline wire format.
//!
//! Pairwise messages travel as an [`Envelope`]: either a plain
//! [`RatchetMessage`] or, until the responder has replied, the same message
//! wrapped together with the [`InitialMessage`] that lets the responder run
//! X3DH. The [`MessageHeader`] has a fixed binary layout because its exact
//! bytes are authenticated as associated data. Everything else is CBOR.
//!
//! Group traffic uses [`SenderKeyDistribution`] (carried inside a pairwise
//! envelope) and [`GroupMessage`] (fanned out by the relay).
//!
//! Nothing here is authenticated on parse. Parsers bound their input and
//! reject malformed bytes; authenticity is established by the AEAD layer.

#![forbid(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod extension;
pub mod group;
pub mod header;

pub use envelope::{Envelope, InitialMessage, RatchetMessage};
pub use errors::{ProtocolError, Result};
pub use extension::Extension;
pub use group::{GroupMessage, SenderKeyDistribution};
pub use header::MessageHeader;

/// Largest encoded envelope or group message accepted by the decoders.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

pub(crate) fn to_cbor<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn from_cbor<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge { size: bytes.len(), max: MAX_MESSAGE_SIZE });
    }
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}
