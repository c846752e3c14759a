//! Fuzz sender-key group decryption.
//!
//! # Strategy
//!
//! - Alice creates a sender key and hands it to Bob over their session
//! - Alice sends a handful of group messages
//! - Bob receives forged variants: other groups, generations and
//!   iterations, flipped nonce or ciphertext bits
//!
//! # Invariants
//!
//! - Decryption never panics
//! - A rejected message leaves Bob's sender key record untouched
//! - Genuine messages still decrypt afterwards, each at most once

#![no_main]

use arbitrary::Arbitrary;
use hushline_core::{
    EngineConfig, GroupKeyManager, IdentityManager, KeyStore, MemoryKeyStore, PeerAddress,
    PreKeyBundle, PreKeyManager, SessionManager, SimEnv,
};
use hushline_proto::GroupMessage;
use libfuzzer_sys::fuzz_target;

const GROUP: &str = "fuzz";

#[derive(Debug, Arbitrary)]
enum Mutation {
    GroupId(String),
    KeyId(u32),
    Iteration(u32),
    Nonce { index: u8, mask: u8 },
    Ciphertext { index: u16, mask: u8 },
    Truncate(u16),
}

#[derive(Debug, Arbitrary)]
struct Scenario {
    seed: u64,
    sent: u8,
    target: u8,
    mutations: Vec<Mutation>,
}

struct Member {
    address: PeerAddress,
    sessions: SessionManager<MemoryKeyStore, SimEnv>,
    groups: GroupKeyManager<MemoryKeyStore, SimEnv>,
    bundle: PreKeyBundle,
}

impl Member {
    fn new(name: &str, env: &SimEnv) -> Self {
        let store = MemoryKeyStore::new();
        let config = EngineConfig::default();
        let identity = IdentityManager::new(store.clone(), env.clone()).generate_identity().unwrap();
        let pre_keys = PreKeyManager::new(store.clone(), env.clone(), config.pre_keys.clone());
        let signed = pre_keys.generate_signed_pre_key(&identity).unwrap();
        let one_time = pre_keys.generate_one_time_pre_keys(1).unwrap();

        let address = PeerAddress::user(name);
        let sessions = SessionManager::new(store, env.clone(), config).unwrap();
        Self {
            groups: GroupKeyManager::new(address.clone(), sessions.clone()),
            address,
            sessions,
            bundle: PreKeyBundle {
                identity_key: identity.public_key(),
                signed_pre_key: signed.public(),
                one_time_pre_key: Some(one_time[0].public()),
            },
        }
    }
}

fn mutate(message: &GroupMessage, mutation: &Mutation) -> GroupMessage {
    let mut forged = message.clone();
    match mutation {
        Mutation::GroupId(group_id) => forged.group_id.clone_from(group_id),
        Mutation::KeyId(key_id) => forged.key_id = *key_id,
        Mutation::Iteration(iteration) => forged.iteration = *iteration,
        Mutation::Nonce { index, mask } => {
            let len = forged.nonce.len();
            forged.nonce[usize::from(*index) % len] ^= mask | 1;
        },
        Mutation::Ciphertext { index, mask } => {
            let len = forged.ciphertext.len();
            forged.ciphertext[usize::from(*index) % len] ^= mask | 1;
        },
        Mutation::Truncate(len) => forged.ciphertext.truncate(usize::from(*len)),
    }
    forged
}

fuzz_target!(|scenario: Scenario| {
    let env = SimEnv::with_seed(scenario.seed);
    let alice = Member::new("alice", &env);
    let bob = Member::new("bob", &env);

    alice.sessions.start_session(&bob.address, &bob.bundle).unwrap();
    let distributions = alice.groups.create_sender_key(GROUP, &[bob.address.clone()]).unwrap();
    assert!(bob.groups.process_distribution(&alice.address, &distributions[0].1).unwrap());

    let count = usize::from(scenario.sent % 8) + 1;
    let sent: Vec<(Vec<u8>, GroupMessage)> = (0..count)
        .map(|i| {
            let text = vec![i as u8; 12];
            let message = alice.groups.encrypt_group_message(GROUP, &text).unwrap();
            (text, message)
        })
        .collect();
    let (_, target) = &sent[usize::from(scenario.target) % count];

    for mutation in scenario.mutations.iter().take(32) {
        let forged = mutate(target, mutation);
        let before = bob.sessions.store().load_sender_key(GROUP, &alice.address).unwrap().unwrap();

        match bob.groups.decrypt_group_message(&alice.address, &forged) {
            Ok(plaintext) => assert!(sent.iter().any(|(text, _)| *text == plaintext)),
            Err(_) => {
                let after =
                    bob.sessions.store().load_sender_key(GROUP, &alice.address).unwrap().unwrap();
                assert_eq!(after.current_key_id(), before.current_key_id());
                assert_eq!(after.current_iteration(), before.current_iteration());
                assert_eq!(after.retired_count(), before.retired_count());
            },
        }
    }

    for (text, message) in &sent {
        if let Ok(plaintext) = bob.groups.decrypt_group_message(&alice.address, message) {
            assert_eq!(&plaintext, text);
        }
        assert!(bob.groups.decrypt_group_message(&alice.address, message).is_err());
    }
});
