//! Fuzz pairwise decryption on an established session.
//!
//! # Strategy
//!
//! - Establish an acknowledged Alice/Bob session from a fuzzed seed
//! - Alice sends a few genuine messages
//! - Deliver mutated copies (header fields, nonce, ciphertext bits, forged
//!   X3DH wrappers) or raw decoded bytes to Bob
//!
//! # Invariants
//!
//! - Decryption never panics
//! - A rejected message leaves Bob's stored session exactly as it was
//! - After any rejected input the genuine messages still decrypt
//! - Anything Bob accepts is one of the plaintexts Alice sent

#![no_main]

use arbitrary::Arbitrary;
use hushline_core::{
    EngineConfig, IdentityManager, KeyStore, MemoryKeyStore, PeerAddress, PreKeyBundle,
    PreKeyManager, SessionManager, SimEnv,
};
use hushline_crypto::{IdentityKey, PublicKey};
use hushline_proto::{Envelope, InitialMessage};
use libfuzzer_sys::fuzz_target;

type Manager = SessionManager<MemoryKeyStore, SimEnv>;

#[derive(Debug, Arbitrary)]
enum Mutation {
    Counter(u32),
    PreviousCounter(u32),
    RatchetKey([u8; 32]),
    Nonce { index: u8, mask: u8 },
    Ciphertext { index: u16, mask: u8 },
    Truncate(u16),
    Append(Vec<u8>),
    ForgeInitial { identity: [u8; 32], ephemeral: [u8; 32], signed_pre_key_id: u32, one_time: Option<u32> },
    Raw(Vec<u8>),
}

#[derive(Debug, Arbitrary)]
struct Scenario {
    seed: u64,
    sent: u8,
    target: u8,
    mutations: Vec<Mutation>,
}

fn device(env: &SimEnv) -> (Manager, PreKeyBundle) {
    let store = MemoryKeyStore::new();
    let config = EngineConfig::default();
    let identity = IdentityManager::new(store.clone(), env.clone()).generate_identity().unwrap();
    let pre_keys = PreKeyManager::new(store.clone(), env.clone(), config.pre_keys.clone());
    let signed = pre_keys.generate_signed_pre_key(&identity).unwrap();
    let one_time = pre_keys.generate_one_time_pre_keys(1).unwrap();
    let bundle = PreKeyBundle {
        identity_key: identity.public_key(),
        signed_pre_key: signed.public(),
        one_time_pre_key: Some(one_time[0].public()),
    };
    (SessionManager::new(store, env.clone(), config).unwrap(), bundle)
}

fn mutate(envelope: &Envelope, mutation: &Mutation) -> Option<Envelope> {
    let mut message = envelope.message().clone();
    match mutation {
        Mutation::Counter(counter) => message.header.counter = *counter,
        Mutation::PreviousCounter(previous) => message.header.previous_counter = *previous,
        Mutation::RatchetKey(key) => message.header.ratchet_key = PublicKey::from_bytes(*key),
        Mutation::Nonce { index, mask } => {
            let len = message.nonce.len();
            message.nonce[usize::from(*index) % len] ^= mask | 1;
        },
        Mutation::Ciphertext { index, mask } => {
            let len = message.ciphertext.len();
            message.ciphertext[usize::from(*index) % len] ^= mask | 1;
        },
        Mutation::Truncate(len) => message.ciphertext.truncate(usize::from(*len)),
        Mutation::Append(bytes) => message.ciphertext.extend_from_slice(bytes),
        Mutation::ForgeInitial { identity, ephemeral, signed_pre_key_id, one_time } => {
            let initial = InitialMessage {
                identity_key: IdentityKey::from_bytes(*identity),
                ephemeral_key: PublicKey::from_bytes(*ephemeral),
                signed_pre_key_id: *signed_pre_key_id,
                one_time_pre_key_id: *one_time,
                extensions: Vec::new(),
            };
            return Some(Envelope::PreKey { initial, message });
        },
        Mutation::Raw(bytes) => return Envelope::decode(bytes).ok(),
    }
    Some(Envelope::Message(message))
}

fuzz_target!(|scenario: Scenario| {
    let env = SimEnv::with_seed(scenario.seed);
    let (alice, _) = device(&env);
    let (bob, bob_bundle) = device(&env);
    let alice_addr = PeerAddress::user("alice");
    let bob_addr = PeerAddress::user("bob");

    alice.start_session(&bob_addr, &bob_bundle).unwrap();
    let hello = alice.encrypt(&bob_addr, b"hello").unwrap();
    bob.decrypt(&alice_addr, &hello).unwrap();
    let ack = bob.encrypt(&alice_addr, b"ack").unwrap();
    alice.decrypt(&bob_addr, &ack).unwrap();

    let count = usize::from(scenario.sent % 8) + 1;
    let sent: Vec<(Vec<u8>, Envelope)> = (0..count)
        .map(|i| {
            let text = vec![i as u8; 16];
            let envelope = alice.encrypt(&bob_addr, &text).unwrap();
            (text, envelope)
        })
        .collect();
    let (_, target) = &sent[usize::from(scenario.target) % count];

    for mutation in scenario.mutations.iter().take(32) {
        let Some(forged) = mutate(target, mutation) else {
            continue;
        };
        let before = bob.store().load_session(&alice_addr).unwrap().unwrap();

        match bob.decrypt(&alice_addr, &forged) {
            Ok(plaintext) => {
                // Only an unchanged or equivalent envelope may open
                assert!(sent.iter().any(|(text, _)| *text == plaintext));
            },
            Err(_) => {
                let after = bob.store().load_session(&alice_addr).unwrap().unwrap();
                assert_eq!(after.root_key(), before.root_key());
                assert_eq!(after.receiving_index(), before.receiving_index());
                assert_eq!(after.remote_ratchet_key(), before.remote_ratchet_key());
                assert_eq!(after.skipped_key_count(), before.skipped_key_count());
                assert_eq!(after.state(), before.state());
            },
        }
    }

    // ORACLE: every genuine message opens at most once and nothing forged
    // broke the chain
    for (text, envelope) in &sent {
        if let Ok(plaintext) = bob.decrypt(&alice_addr, envelope) {
            assert_eq!(&plaintext, text);
        }
    }
    let reply = bob.encrypt(&alice_addr, b"still here").unwrap();
    assert_eq!(alice.decrypt(&bob_addr, &reply).unwrap(), b"still here");
});
