//! End-to-end pairwise sessions through the key directory.
//!
//! Two devices publish keys, one fetches the other's bundle, and the pair
//! exchange messages with reordering, loss of the first message and replays.

use std::{sync::Arc, thread};

use hushline_core::{
    DecryptFailure, EngineConfig, EngineError, IdentityManager, KeyDirectory,
    KeyStore, MemoryKeyDirectory, MemoryKeyStore, PeerAddress, PreKeyBundle, PreKeyManager, SessionManager,
    SessionState, SimEnv,
};
use hushline_proto::Envelope;
use rand::{Rng, SeedableRng, seq::SliceRandom};
use rand_chacha::ChaCha8Rng;

struct Device {
    address: PeerAddress,
    store: MemoryKeyStore,
    sessions: SessionManager<MemoryKeyStore, SimEnv>,
    pre_keys: PreKeyManager<MemoryKeyStore, SimEnv>,
}

impl Device {
    fn new(name: &str, env: &SimEnv) -> Self {
        let store = MemoryKeyStore::new();
        let config = EngineConfig::default();
        let identity = IdentityManager::new(store.clone(), env.clone()).generate_identity().unwrap();

        let pre_keys = PreKeyManager::new(store.clone(), env.clone(), config.pre_keys.clone());
        pre_keys.generate_signed_pre_key(&identity).unwrap();

        Self {
            address: PeerAddress::user(name),
            sessions: SessionManager::new(store.clone(), env.clone(), config).unwrap(),
            store,
            pre_keys,
        }
    }

    fn publish(&self, directory: &impl KeyDirectory, one_time: u32) {
        let identity = self.store.load_identity().unwrap().unwrap();
        self.pre_keys.generate_one_time_pre_keys(one_time).unwrap();
        directory.publish(self.address.user_id(), &self.pre_keys.key_upload(&identity).unwrap()).unwrap();
    }

    fn connect(&self, peer: &Device, directory: &impl KeyDirectory) {
        let bundle = directory.fetch_bundle(peer.address.user_id()).unwrap();
        self.sessions.start_session(&peer.address, &bundle).unwrap();
    }

    /// Bundle as served by a directory whose one-time pre-keys ran out.
    fn bundle_without_one_time(&self) -> PreKeyBundle {
        let identity = self.store.load_identity().unwrap().unwrap();
        let signed = self.pre_keys.current_signed_pre_key().unwrap().unwrap();
        PreKeyBundle {
            identity_key: identity.public_key(),
            signed_pre_key: signed.public(),
            one_time_pre_key: None,
        }
    }

    fn send(&self, to: &Device, text: &[u8]) -> Envelope {
        self.sessions.encrypt(&to.address, text).unwrap()
    }

    fn receive(&self, from: &Device, envelope: &Envelope) -> Result<Vec<u8>, EngineError> {
        self.sessions.decrypt(&from.address, envelope)
    }
}

fn duplicate() -> EngineError {
    EngineError::decryption(DecryptFailure::Duplicate)
}

#[test]
fn alice_and_bob_converse() {
    let env = SimEnv::with_seed(42);
    let directory = MemoryKeyDirectory::new();
    let alice = Device::new("alice", &env);
    let bob = Device::new("bob", &env);

    alice.publish(&directory, 20);
    assert_eq!(directory.count_available("alice").unwrap(), 20);

    bob.connect(&alice, &directory);
    assert_eq!(directory.count_available("alice").unwrap(), 19);

    let hello = bob.send(&alice, b"hello");
    assert!(hello.initial().is_some());
    assert_eq!(alice.receive(&bob, &hello).unwrap(), b"hello");

    // Both sides derived the same secret
    let bob_session = bob.sessions.load_session(&alice.address).unwrap().unwrap();
    let alice_session = alice.sessions.load_session(&bob.address).unwrap().unwrap();
    assert_eq!(bob_session.root_key(), alice_session.root_key());
    assert_eq!(alice.pre_keys.unused_one_time_count().unwrap(), 19);

    // Five more on the same sending chain, read in order
    let ratchet_key = hello.message().header.ratchet_key;
    for n in 1..=5u8 {
        let envelope = bob.send(&alice, &[b'm', n]);
        assert_eq!(envelope.message().header.ratchet_key, ratchet_key);
        assert_eq!(envelope.message().header.counter, u32::from(n));
        assert_eq!(alice.receive(&bob, &envelope).unwrap(), [b'm', n]);
    }
    let alice_session = alice.sessions.load_session(&bob.address).unwrap().unwrap();
    assert_eq!(alice_session.root_key(), bob_session.root_key());
    assert_eq!(alice_session.skipped_key_count(), 0);

    // Alice is offline while Bob sends two more; the relay hands them over
    // newest first
    let sixth = bob.send(&alice, b"sixth");
    let seventh = bob.send(&alice, b"seventh");
    assert_eq!(alice.receive(&bob, &seventh).unwrap(), b"seventh");
    let alice_session = alice.sessions.load_session(&bob.address).unwrap().unwrap();
    assert_eq!(alice_session.skipped_key_count(), 1);

    assert_eq!(alice.receive(&bob, &sixth).unwrap(), b"sixth");
    let alice_session = alice.sessions.load_session(&bob.address).unwrap().unwrap();
    assert_eq!(alice_session.skipped_key_count(), 0);
    assert_eq!(alice.receive(&bob, &sixth).unwrap_err(), duplicate());

    assert_eq!(alice.sessions.session_state(&bob.address).unwrap(), Some(SessionState::Established));
    assert_eq!(bob.sessions.session_state(&alice.address).unwrap(), Some(SessionState::Established));
}

#[test]
fn offline_messages_arrive_out_of_order() {
    let env = SimEnv::with_seed(7);
    let directory = MemoryKeyDirectory::new();
    let alice = Device::new("alice", &env);
    let bob = Device::new("bob", &env);
    bob.publish(&directory, 20);
    alice.connect(&bob, &directory);

    let hello = alice.send(&bob, b"hello");
    bob.receive(&alice, &hello).unwrap();
    let ack = bob.send(&alice, b"ack");
    alice.receive(&bob, &ack).unwrap();

    let m1 = alice.send(&bob, b"m1");
    let m2 = alice.send(&bob, b"m2");
    let m3 = alice.send(&bob, b"m3");

    assert_eq!(bob.receive(&alice, &m3).unwrap(), b"m3");
    let session = bob.sessions.load_session(&alice.address).unwrap().unwrap();
    assert_eq!(session.skipped_key_count(), 2);

    assert_eq!(bob.receive(&alice, &m1).unwrap(), b"m1");
    assert_eq!(bob.receive(&alice, &m2).unwrap(), b"m2");
    let session = bob.sessions.load_session(&alice.address).unwrap().unwrap();
    assert_eq!(session.skipped_key_count(), 0);

    assert_eq!(bob.receive(&alice, &m1).unwrap_err(), duplicate());
    assert_eq!(bob.receive(&alice, &m3).unwrap_err(), duplicate());
}

#[test]
fn lost_first_message_does_not_strand_session() {
    let env = SimEnv::with_seed(8);
    let directory = MemoryKeyDirectory::new();
    let alice = Device::new("alice", &env);
    let bob = Device::new("bob", &env);
    bob.publish(&directory, 20);
    alice.connect(&bob, &directory);

    let _lost = alice.send(&bob, b"lost");
    let second = alice.send(&bob, b"second");

    assert_eq!(bob.receive(&alice, &second).unwrap(), b"second");
    assert_eq!(bob.receive(&alice, &second).unwrap_err(), duplicate());
}

#[test]
fn bundle_without_one_time_pre_key_still_works() {
    let env = SimEnv::with_seed(9);
    let directory = MemoryKeyDirectory::new();
    let alice = Device::new("alice", &env);
    let bob = Device::new("bob", &env);
    bob.publish(&directory, 20);

    for _ in 0..20 {
        directory.fetch_bundle("bob").unwrap();
    }
    alice.connect(&bob, &directory);

    let hello = alice.send(&bob, b"hello");
    assert_eq!(hello.initial().unwrap().one_time_pre_key_id, None);
    assert_eq!(bob.receive(&alice, &hello).unwrap(), b"hello");
}

#[test]
fn consumed_one_time_pre_key_is_retriable_failure() {
    let env = SimEnv::with_seed(10);
    let directory = MemoryKeyDirectory::new();
    let alice = Device::new("alice", &env);
    let carol = Device::new("carol", &env);
    let bob = Device::new("bob", &env);
    bob.publish(&directory, 20);

    // A misbehaving directory hands the same bundle out twice
    let bundle = directory.fetch_bundle("bob").unwrap();
    alice.sessions.start_session(&bob.address, &bundle).unwrap();
    carol.sessions.start_session(&bob.address, &bundle).unwrap();

    let from_alice = alice.send(&bob, b"alice");
    let from_carol = carol.send(&bob, b"carol");

    assert_eq!(bob.receive(&alice, &from_alice).unwrap(), b"alice");
    let err = bob.receive(&carol, &from_carol).unwrap_err();
    assert!(matches!(err, EngineError::SessionEstablishmentFailed { .. }));
    assert!(err.is_retriable());
    assert!(!bob.sessions.has_session(&carol.address).unwrap());

    // Carol retries with a fresh bundle
    carol.connect(&bob, &directory);
    let retry = carol.send(&bob, b"carol again");
    assert_eq!(bob.receive(&carol, &retry).unwrap(), b"carol again");
}

#[test]
fn racing_handshakes_consume_one_time_pre_key_once() {
    let env = SimEnv::with_seed(11);
    let directory = MemoryKeyDirectory::new();
    let bob = Arc::new(Device::new("bob", &env));
    bob.publish(&directory, 20);
    let bundle = directory.fetch_bundle("bob").unwrap();

    let initiators: Vec<_> = (0..4).map(|i| Device::new(&format!("peer-{i}"), &env)).collect();
    let first_messages: Vec<_> = initiators
        .iter()
        .map(|device| {
            device.sessions.start_session(&bob.address, &bundle).unwrap();
            (device.address.clone(), device.send(&bob, b"race"))
        })
        .collect();

    let workers: Vec<_> = first_messages
        .into_iter()
        .map(|(from, envelope)| {
            let bob = Arc::clone(&bob);
            thread::spawn(move || bob.sessions.decrypt(&from, &envelope))
        })
        .collect();
    let results: Vec<_> = workers.into_iter().map(|worker| worker.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(results.iter().all(|result| match result {
        Ok(plaintext) => plaintext == b"race",
        Err(err) => matches!(err, EngineError::SessionEstablishmentFailed { .. }),
    }));
}

#[test]
fn directory_replenishment_after_fetches() {
    let env = SimEnv::with_seed(12);
    let directory = MemoryKeyDirectory::new();
    let bob = Device::new("bob", &env);
    bob.publish(&directory, 25);

    for _ in 0..10 {
        directory.fetch_bundle("bob").unwrap();
    }
    let available = directory.count_available("bob").unwrap();
    assert_eq!(available, 15);

    let identity = bob.store.load_identity().unwrap().unwrap();
    let report = bob.pre_keys.run_maintenance(&identity, Some(available)).unwrap();
    assert_eq!(report.new_one_time_pre_keys.len(), 85);
    assert!(report.needs_publish());

    directory.publish("bob", &bob.pre_keys.key_upload(&identity).unwrap()).unwrap();
    assert_eq!(directory.count_available("bob").unwrap(), 100);
}

#[test]
fn shuffling_relay_with_duplicates() {
    let env = SimEnv::with_seed(11);
    let directory = MemoryKeyDirectory::new();
    let alice = Device::new("alice", &env);
    let bob = Device::new("bob", &env);
    bob.publish(&directory, 20);
    alice.connect(&bob, &directory);

    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let mut expected_alice = 0usize;
    let mut expected_bob = 0usize;

    for round in 0..10u8 {
        // Each side sends a burst; the relay duplicates some and shuffles
        let mut in_flight = Vec::new();
        for n in 0..rng.gen_range(1..5u8) {
            let text = vec![round, n, 0];
            let envelope = alice.send(&bob, &text);
            if rng.gen_bool(0.3) {
                in_flight.push((true, envelope.clone(), text.clone()));
            }
            in_flight.push((true, envelope, text));
            expected_bob += 1;
        }
        // Bob only replies once the session is acknowledged from his side
        if round > 0 {
            for n in 0..rng.gen_range(1..5u8) {
                let text = vec![round, n, 1];
                let envelope = bob.send(&alice, &text);
                if rng.gen_bool(0.3) {
                    in_flight.push((false, envelope.clone(), text.clone()));
                }
                in_flight.push((false, envelope, text));
                expected_alice += 1;
            }
        }
        in_flight.shuffle(&mut rng);

        for (to_bob, envelope, text) in in_flight {
            let result =
                if to_bob { bob.receive(&alice, &envelope) } else { alice.receive(&bob, &envelope) };
            match result {
                Ok(plaintext) => {
                    assert_eq!(plaintext, text);
                    if to_bob { expected_bob -= 1 } else { expected_alice -= 1 }
                },
                Err(err) => assert_eq!(err, duplicate()),
            }
        }
    }

    assert_eq!((expected_alice, expected_bob), (0, 0));
}

#[test]
fn replayed_handshake_cannot_replace_newer_session() {
    let env = SimEnv::with_seed(12);
    let alice = Device::new("alice", &env);
    let bob = Device::new("bob", &env);

    alice.sessions.start_session(&bob.address, &bob.bundle_without_one_time()).unwrap();
    let hello = alice.send(&bob, b"hello");
    assert_eq!(bob.receive(&alice, &hello).unwrap(), b"hello");

    // Alice re-keys with a fresh handshake
    alice.sessions.start_session(&bob.address, &bob.bundle_without_one_time()).unwrap();
    let fresh = alice.send(&bob, b"fresh");
    assert_eq!(bob.receive(&alice, &fresh).unwrap(), b"fresh");
    let reply = bob.send(&alice, b"reply");
    assert_eq!(alice.receive(&bob, &reply).unwrap(), b"reply");

    let before = bob.sessions.load_session(&alice.address).unwrap().unwrap();
    assert_eq!(bob.receive(&alice, &hello).unwrap_err(), duplicate());
    let after = bob.sessions.load_session(&alice.address).unwrap().unwrap();
    assert_eq!(after.base_key(), before.base_key());
    assert_eq!(after.root_key(), before.root_key());

    let next = alice.send(&bob, b"next");
    assert_eq!(bob.receive(&alice, &next).unwrap(), b"next");
    let back = bob.send(&alice, b"back");
    assert_eq!(alice.receive(&bob, &back).unwrap(), b"back");
}

#[test]
fn replayed_handshake_is_rejected_after_roles_swap() {
    let env = SimEnv::with_seed(13);
    let alice = Device::new("alice", &env);
    let bob = Device::new("bob", &env);

    alice.sessions.start_session(&bob.address, &bob.bundle_without_one_time()).unwrap();
    let hello = alice.send(&bob, b"hello");
    bob.receive(&alice, &hello).unwrap();

    // Bob replaces the session by initiating his own handshake
    bob.sessions.start_session(&alice.address, &alice.bundle_without_one_time()).unwrap();
    let restart = bob.send(&alice, b"restart");
    assert_eq!(alice.receive(&bob, &restart).unwrap(), b"restart");

    assert_eq!(bob.receive(&alice, &hello).unwrap_err(), duplicate());
    let answer = alice.send(&bob, b"answer");
    assert_eq!(bob.receive(&alice, &answer).unwrap(), b"answer");
}
