//! Hushline session engine.
//!
//! Key management and message encryption for one device. Transport, the key
//! directory service and backup storage are collaborators behind traits;
//! nothing here does I/O except the key store.
//!
//! # Components
//!
//! - [`IdentityManager`]: long-term Ed25519 identity, generated once
//! - [`PreKeyManager`]: signed and one-time pre-keys, rotation and
//!   replenishment
//! - [`SessionEstablisher`]: X3DH for both roles
//! - [`RatchetEngine`]: Double Ratchet encrypt/decrypt over a [`Session`]
//! - [`SessionManager`]: per-peer sessions with load, mutate, persist
//!   transactions and per-peer locking
//! - [`GroupKeyManager`]: sender keys for group fan-out
//! - [`export_backup`] / [`restore_backup`]: recovery-phrase encrypted backup
//!
//! # Failure Semantics
//!
//! An operation that fails leaves stored state exactly as it was. In
//! particular a message that does not authenticate never advances a ratchet,
//! and a handshake that does not authenticate never consumes a one-time
//! pre-key.

#![forbid(unsafe_code)]

pub mod address;
pub mod backup;
pub mod config;
pub mod directory;
pub mod env;
pub mod error;
pub mod group;
pub mod identity;
mod locks;
pub mod manager;
pub mod prekeys;
pub mod ratchet;
pub mod session;
pub mod skipped;
pub mod store;
pub mod x3dh;

pub use address::PeerAddress;
pub use backup::{
    BackupStorage, MemoryBackupStorage, RecoveryPhrase, RestoreSummary, export_backup,
    restore_backup,
};
pub use config::{EngineConfig, PreKeyPolicy, SkippedKeyPolicy};
pub use directory::{DirectoryError, KeyDirectory, MemoryKeyDirectory};
pub use env::{Environment, SimEnv, SystemEnv};
pub use error::{DecryptFailure, EngineError};
pub use group::{GroupKeyManager, SenderKeyRecord, SenderKeyState};
pub use identity::IdentityManager;
pub use manager::SessionManager;
pub use prekeys::{
    KeyUpload, MaintenanceReport, OneTimePreKey, PreKeyBundle, PreKeyManager, SignedPreKey,
};
pub use ratchet::RatchetEngine;
pub use session::{Session, SessionState};
pub use store::{ChaoticKeyStore, KeyStore, MemoryKeyStore, RedbKeyStore, StorageError, StorageKey};
pub use x3dh::SessionEstablisher;
