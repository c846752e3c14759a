//! Fuzz the wire decoders with hostile bytes.
//!
//! # Strategy
//!
//! - Raw bytes straight into every decoder
//! - Structurally valid headers with arbitrary fields
//! - CBOR shapes that claim huge lengths or nest deeply
//!
//! # Invariants
//!
//! - No decoder panics or allocates according to a claimed length
//! - A header that parses re-encodes to the exact input bytes
//! - An envelope or group message that decodes survives a re-encode
//!   unchanged

#![no_main]

use arbitrary::Arbitrary;
use hushline_crypto::PublicKey;
use hushline_proto::{Envelope, GroupMessage, MessageHeader, SenderKeyDistribution};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum WireInput {
    Raw(Vec<u8>),
    Header { ratchet_key: [u8; 32], counter: u32, previous_counter: u32, trailing: Vec<u8> },
    HugeLength { exponent: u8, major: u8 },
    DeeplyNested { depth: u8 },
}

fuzz_target!(|input: WireInput| {
    match input {
        WireInput::Raw(bytes) => {
            check_header(&bytes);
            check_decoders(&bytes);
        },

        WireInput::Header { ratchet_key, counter, previous_counter, trailing } => {
            let header = MessageHeader {
                ratchet_key: PublicKey::from_bytes(ratchet_key),
                counter,
                previous_counter,
            };
            let encoded = header.to_bytes();
            assert_eq!(MessageHeader::from_bytes(&encoded).ok(), Some(header));

            let mut extended = encoded.to_vec();
            extended.extend_from_slice(&trailing);
            if !trailing.is_empty() {
                assert!(MessageHeader::from_bytes(&extended).is_err());
            }
            check_decoders(&extended);
        },

        WireInput::HugeLength { exponent, major } => {
            // Byte string, text string, array or map with a 32-bit length
            let major = [0x5A, 0x7A, 0x9A, 0xBA][usize::from(major % 4)];
            let claimed = 1u32 << (exponent % 32);
            let mut bytes = vec![major];
            bytes.extend_from_slice(&claimed.to_be_bytes());
            check_decoders(&bytes);
        },

        WireInput::DeeplyNested { depth } => {
            let mut bytes = vec![0x81; usize::from(depth)];
            bytes.push(0x01);
            check_decoders(&bytes);
        },
    }
});

fn check_header(bytes: &[u8]) {
    if let Ok(header) = MessageHeader::from_bytes(bytes) {
        assert_eq!(header.to_bytes().as_slice(), bytes);
    }
}

fn check_decoders(bytes: &[u8]) {
    if let Ok(envelope) = Envelope::decode(bytes)
        && let Ok(encoded) = envelope.encode()
    {
        assert_eq!(Envelope::decode(&encoded).ok(), Some(envelope));
    }

    if let Ok(message) = GroupMessage::decode(bytes)
        && let Ok(encoded) = message.encode()
    {
        assert_eq!(GroupMessage::decode(&encoded).ok(), Some(message));
    }

    let _ = SenderKeyDistribution::decode(bytes);
}
