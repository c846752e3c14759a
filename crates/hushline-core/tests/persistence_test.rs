//! Durability: redb restarts and backup/restore onto a new device.

use hushline_core::{
    BackupStorage, EngineConfig, EngineError, IdentityManager, KeyStore, MemoryBackupStorage,
    MemoryKeyStore, PeerAddress, PreKeyBundle, PreKeyManager, RecoveryPhrase, RedbKeyStore,
    SessionManager, SimEnv, StorageKey, export_backup, restore_backup,
};
use tempfile::tempdir;

fn bundle_for<S: KeyStore>(store: &S, env: &SimEnv) -> PreKeyBundle {
    let identity = IdentityManager::new(store.clone(), env.clone()).generate_identity().unwrap();
    let pre_keys = PreKeyManager::new(store.clone(), env.clone(), EngineConfig::default().pre_keys);
    let signed = pre_keys.generate_signed_pre_key(&identity).unwrap();
    let one_time = pre_keys.generate_one_time_pre_keys(1).unwrap();
    PreKeyBundle {
        identity_key: identity.public_key(),
        signed_pre_key: signed.public(),
        one_time_pre_key: Some(one_time[0].public()),
    }
}

fn manager<S: KeyStore>(store: S, env: &SimEnv) -> SessionManager<S, SimEnv> {
    SessionManager::new(store, env.clone(), EngineConfig::default()).unwrap()
}

#[test]
fn session_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bob.redb");
    let key = StorageKey::from_bytes([5; 32]);
    let env = SimEnv::with_seed(1);
    let alice_addr = PeerAddress::user("alice");
    let bob_addr = PeerAddress::user("bob");

    let alice_store = MemoryKeyStore::new();
    IdentityManager::new(alice_store.clone(), env.clone()).generate_identity().unwrap();
    let alice = manager(alice_store, &env);

    let pending = {
        let bob_store = RedbKeyStore::open(&path, key.clone()).unwrap();
        let bundle = bundle_for(&bob_store, &env);
        let bob = manager(bob_store, &env);

        alice.start_session(&bob_addr, &bundle).unwrap();
        let hello = alice.encrypt(&bob_addr, b"hello").unwrap();
        assert_eq!(bob.decrypt(&alice_addr, &hello).unwrap(), b"hello");

        let reply = bob.encrypt(&alice_addr, b"reply").unwrap();
        alice.decrypt(&bob_addr, &reply).unwrap();

        // Sent while Bob is down
        [alice.encrypt(&bob_addr, b"one").unwrap(), alice.encrypt(&bob_addr, b"two").unwrap()]
    };

    let bob = manager(RedbKeyStore::open(&path, key).unwrap(), &env);
    assert!(bob.has_session(&alice_addr).unwrap());
    assert_eq!(bob.decrypt(&alice_addr, &pending[1]).unwrap(), b"two");
    assert_eq!(bob.decrypt(&alice_addr, &pending[0]).unwrap(), b"one");

    let back = bob.encrypt(&alice_addr, b"back").unwrap();
    assert_eq!(alice.decrypt(&bob_addr, &back).unwrap(), b"back");
}

#[test]
fn consumed_one_time_pre_key_stays_consumed_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bob.redb");
    let key = StorageKey::from_bytes([6; 32]);
    let env = SimEnv::with_seed(2);

    let bundle = {
        let store = RedbKeyStore::open(&path, key.clone()).unwrap();
        let bundle = bundle_for(&store, &env);
        let one_time_id = bundle.one_time_pre_key.unwrap().key_id;
        assert!(store.consume_one_time_pre_key(one_time_id).unwrap());
        bundle
    };

    let store = RedbKeyStore::open(&path, key).unwrap();
    let one_time_id = bundle.one_time_pre_key.unwrap().key_id;
    assert!(!store.consume_one_time_pre_key(one_time_id).unwrap());
    assert!(store.load_one_time_pre_key(one_time_id).unwrap().unwrap().key_pair().is_none());
}

#[test]
fn restored_device_continues_conversation() {
    let env = SimEnv::with_seed(3);
    let alice_addr = PeerAddress::user("alice");
    let bob_addr = PeerAddress::user("bob");

    let alice_store = MemoryKeyStore::new();
    IdentityManager::new(alice_store.clone(), env.clone()).generate_identity().unwrap();
    let alice = manager(alice_store, &env);

    let bob_store = MemoryKeyStore::new();
    let bundle = bundle_for(&bob_store, &env);
    let bob = manager(bob_store.clone(), &env);

    alice.start_session(&bob_addr, &bundle).unwrap();
    let hello = alice.encrypt(&bob_addr, b"hello").unwrap();
    bob.decrypt(&alice_addr, &hello).unwrap();

    let phrase = RecoveryPhrase::generate(&env).unwrap();
    let storage = MemoryBackupStorage::new();
    storage.put("bob", &export_backup(&bob_store, &env, &phrase).unwrap()).unwrap();
    drop(bob);

    // New phone: Bob types the phrase back in
    let typed = RecoveryPhrase::parse(&phrase.phrase()).unwrap();
    let new_store = MemoryKeyStore::new();
    let blob = storage.get("bob").unwrap().unwrap();
    let summary = restore_backup(&new_store, &typed, &blob).unwrap();
    assert_eq!(summary.identity, bundle.identity_key);
    assert_eq!(summary.sessions, 1);

    let restored = manager(new_store, &env);
    let next = alice.encrypt(&bob_addr, b"after restore").unwrap();
    assert_eq!(restored.decrypt(&alice_addr, &next).unwrap(), b"after restore");

    let reply = restored.encrypt(&alice_addr, b"restored").unwrap();
    assert_eq!(alice.decrypt(&bob_addr, &reply).unwrap(), b"restored");
}

#[test]
fn restore_refuses_a_different_identity() {
    let env = SimEnv::with_seed(4);
    let source = MemoryKeyStore::new();
    IdentityManager::new(source.clone(), env.clone()).generate_identity().unwrap();
    let phrase = RecoveryPhrase::generate(&env).unwrap();
    let blob = export_backup(&source, &env, &phrase).unwrap();

    let occupied = MemoryKeyStore::new();
    let existing = IdentityManager::new(occupied.clone(), env.clone()).generate_identity().unwrap();

    assert!(matches!(
        restore_backup(&occupied, &phrase, &blob),
        Err(EngineError::BackupFailed { .. })
    ));
    assert_eq!(occupied.load_identity().unwrap(), Some(existing));

    // Same identity restores over itself
    assert!(restore_backup(&source, &phrase, &blob).is_ok());
}

#[test]
fn restore_into_redb_store() {
    let dir = tempdir().unwrap();
    let env = SimEnv::with_seed(5);
    let source = MemoryKeyStore::new();
    bundle_for(&source, &env);
    let phrase = RecoveryPhrase::generate(&env).unwrap();
    let blob = export_backup(&source, &env, &phrase).unwrap();

    let path = dir.path().join("restored.redb");
    let key = StorageKey::from_bytes([7; 32]);
    {
        let store = RedbKeyStore::open(&path, key.clone()).unwrap();
        restore_backup(&store, &phrase, &blob).unwrap();
    }

    let store = RedbKeyStore::open(&path, key).unwrap();
    assert_eq!(store.load_identity().unwrap(), source.load_identity().unwrap());
    assert_eq!(store.list_signed_pre_keys().unwrap().len(), 1);
}
