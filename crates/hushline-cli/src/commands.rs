//! Command implementations.
//!
//! Each command writes human-readable lines to `out`; diagnostics go through
//! `tracing`.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
};

use hushline_core::{
    EngineConfig, Environment, IdentityManager, KeyStore, PreKeyManager, RecoveryPhrase,
    RedbKeyStore, StorageKey, SystemEnv, export_backup, restore_backup,
};
use tracing::info;
use zeroize::Zeroizing;

use crate::error::CliError;

/// Store key from `path`, creating a fresh one if the file does not exist.
pub(crate) fn load_or_create_key(path: &Path) -> Result<StorageKey, CliError> {
    if path.exists() {
        let text = Zeroizing::new(fs::read_to_string(path).map_err(CliError::file(path))?);
        let mut bytes = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(text.trim(), bytes.as_mut_slice())
            .map_err(|_| CliError::InvalidKeyFile { path: path.to_path_buf() })?;
        return Ok(StorageKey::from_bytes(*bytes));
    }

    let key = StorageKey::generate()?;
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(CliError::file(path))?;
    let encoded = Zeroizing::new(hex::encode(key.as_bytes()));
    writeln!(file, "{}", encoded.as_str()).map_err(CliError::file(path))?;

    info!(path = %path.display(), "created store key");
    Ok(key)
}

/// Local device state behind a redb key store.
pub(crate) struct Device<E: Environment = SystemEnv> {
    store: RedbKeyStore,
    env: E,
    config: EngineConfig,
}

impl Device {
    /// Open (or create) the store at `store_path` with the key in `key_path`.
    pub(crate) fn open(store_path: &Path, key_path: &Path) -> Result<Self, CliError> {
        let key = load_or_create_key(key_path)?;
        Ok(Self::with_env(RedbKeyStore::open(store_path, key)?, SystemEnv::new()))
    }
}

impl<E: Environment> Device<E> {
    pub(crate) fn with_env(store: RedbKeyStore, env: E) -> Self {
        Self { store, env, config: EngineConfig::default() }
    }

    fn identities(&self) -> IdentityManager<RedbKeyStore, E> {
        IdentityManager::new(self.store.clone(), self.env.clone())
    }

    fn pre_keys(&self) -> PreKeyManager<RedbKeyStore, E> {
        PreKeyManager::new(self.store.clone(), self.env.clone(), self.config.pre_keys.clone())
    }

    /// Create the identity, a signed pre-key and `one_time` one-time
    /// pre-keys. Safe to rerun: existing material is kept and the one-time
    /// pool is only topped up.
    pub(crate) fn init(&self, one_time: u32, out: &mut impl Write) -> Result<(), CliError> {
        let identity = self.identities().generate_identity()?;
        let pre_keys = self.pre_keys();

        let signed = match pre_keys.current_signed_pre_key()? {
            Some(key) => key,
            None => pre_keys.generate_signed_pre_key(&identity)?,
        };
        let unused = pre_keys.unused_one_time_count()? as u32;
        if unused < one_time {
            pre_keys.generate_one_time_pre_keys(one_time - unused)?;
        }

        writeln!(out, "identity: {}", hex::encode(identity.public_key().as_bytes()))?;
        writeln!(out, "signed pre-key: {}", signed.key_id())?;
        writeln!(out, "one-time pre-keys: {}", pre_keys.unused_one_time_count()?)?;
        Ok(())
    }

    /// Print the key directory upload as hex-encoded CBOR.
    pub(crate) fn bundle(&self, out: &mut impl Write) -> Result<(), CliError> {
        let identity = self.identities().identity()?;
        let upload = self.pre_keys().key_upload(&identity)?;

        let mut encoded = Vec::new();
        ciborium::into_writer(&upload, &mut encoded).map_err(|e| CliError::Encode(e.to_string()))?;
        writeln!(out, "{}", hex::encode(encoded))?;
        Ok(())
    }

    /// Rotate, purge and replenish pre-keys as the policy requires.
    pub(crate) fn maintain(
        &self,
        directory_available: Option<usize>,
        out: &mut impl Write,
    ) -> Result<(), CliError> {
        let identity = self.identities().identity()?;
        let report = self.pre_keys().run_maintenance(&identity, directory_available)?;

        match report.rotated_signed_pre_key {
            Some(key_id) => writeln!(out, "rotated signed pre-key: {key_id}")?,
            None => writeln!(out, "signed pre-key current")?,
        }
        if !report.expired_signed_pre_keys.is_empty() {
            writeln!(out, "deleted signed pre-keys: {:?}", report.expired_signed_pre_keys)?;
        }
        writeln!(out, "new one-time pre-keys: {}", report.new_one_time_pre_keys.len())?;
        if report.needs_publish() {
            writeln!(out, "publish required: run `hushline bundle`")?;
        }
        Ok(())
    }

    /// Write an encrypted backup to `path` and print the recovery phrase.
    pub(crate) fn backup(&self, path: &Path, out: &mut impl Write) -> Result<(), CliError> {
        let phrase = RecoveryPhrase::generate(&self.env)?;
        let blob = export_backup(&self.store, &self.env, &phrase)?;
        fs::write(path, &blob).map_err(CliError::file(path))?;

        writeln!(out, "backup written to {}", path.display())?;
        writeln!(out, "recovery phrase (store it offline; it is shown only once):")?;
        writeln!(out, "{}", phrase.phrase().as_str())?;
        Ok(())
    }

    /// Restore the backup at `path` using `phrase`.
    pub(crate) fn restore(
        &self,
        path: &Path,
        phrase: &str,
        out: &mut impl Write,
    ) -> Result<(), CliError> {
        let phrase = RecoveryPhrase::parse(phrase)?;
        let blob = fs::read(path).map_err(CliError::file(path))?;
        let summary = restore_backup(&self.store, &phrase, &blob)?;

        writeln!(out, "identity: {}", hex::encode(summary.identity.as_bytes()))?;
        writeln!(out, "signed pre-keys: {}", summary.signed_pre_keys)?;
        writeln!(out, "sessions: {}", summary.sessions)?;
        writeln!(out, "sender keys: {}", summary.sender_keys)?;
        writeln!(out, "one-time pre-keys are not backed up: run `hushline init`")?;
        Ok(())
    }

    /// Summarize the key store.
    pub(crate) fn status(&self, out: &mut impl Write) -> Result<(), CliError> {
        let Some(identity) = self.store.load_identity()? else {
            writeln!(out, "identity: not initialized")?;
            return Ok(());
        };
        writeln!(out, "identity: {}", hex::encode(identity.public_key().as_bytes()))?;

        for key in self.store.list_signed_pre_keys()? {
            match key.superseded_at() {
                Some(at) => writeln!(out, "signed pre-key {} (superseded at {at})", key.key_id())?,
                None => writeln!(out, "signed pre-key {} (current)", key.key_id())?,
            }
        }
        writeln!(out, "unused one-time pre-keys: {}", self.store.count_unused_one_time_pre_keys()?)?;

        for peer in self.store.list_sessions()? {
            if let Some(session) = self.store.load_session(&peer)? {
                writeln!(out, "session {peer}: {:?}", session.state())?;
            }
        }
        for record in self.store.list_sender_keys()? {
            writeln!(
                out,
                "sender key {} / {}: generation {}",
                record.group_id(),
                record.sender(),
                record.current_key_id()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use hushline_core::SimEnv;
    use tempfile::tempdir;

    use super::*;

    fn output(run: impl FnOnce(&mut Vec<u8>) -> Result<(), CliError>) -> String {
        let mut out = Vec::new();
        run(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn key_file_is_created_then_reused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.key");

        let created = load_or_create_key(&path).unwrap();
        let loaded = load_or_create_key(&path).unwrap();
        assert_eq!(created.as_bytes(), loaded.as_bytes());

        fs::write(&path, "not hex").unwrap();
        assert!(matches!(load_or_create_key(&path), Err(CliError::InvalidKeyFile { .. })));
    }

    #[test]
    fn init_then_status() {
        let dir = tempdir().unwrap();
        let store = RedbKeyStore::open(dir.path().join("a.redb"), StorageKey::from_bytes([1; 32]))
            .unwrap();
        let device = Device::with_env(store, SimEnv::with_seed(1));

        assert_eq!(output(|out| device.status(out)), "identity: not initialized\n");

        let first = output(|out| device.init(30, out));
        assert!(first.contains("one-time pre-keys: 30"));
        let again = output(|out| device.init(30, out));
        assert_eq!(first, again);

        let status = output(|out| device.status(out));
        assert!(status.contains("signed pre-key 1 (current)"));
        assert!(status.contains("unused one-time pre-keys: 30"));
    }

    #[test]
    fn backup_and_restore_on_another_store() {
        let dir = tempdir().unwrap();
        let source = Device::with_env(
            RedbKeyStore::open(dir.path().join("a.redb"), StorageKey::from_bytes([1; 32])).unwrap(),
            SimEnv::with_seed(2),
        );
        output(|out| source.init(20, out));

        let backup_path = dir.path().join("device.backup");
        let printed = output(|out| source.backup(&backup_path, out));
        let phrase = printed.lines().last().unwrap().to_string();
        assert_eq!(phrase.split(' ').count(), 24);

        let target = Device::with_env(
            RedbKeyStore::open(dir.path().join("b.redb"), StorageKey::from_bytes([2; 32])).unwrap(),
            SimEnv::with_seed(3),
        );
        let restored = output(|out| target.restore(&backup_path, &phrase, out));
        assert!(restored.contains("signed pre-keys: 1"));

        let identity_line = |text: &str| text.lines().next().unwrap().to_string();
        assert_eq!(
            identity_line(&output(|out| source.status(out))),
            identity_line(&output(|out| target.status(out)))
        );
    }

    #[test]
    fn bundle_requires_identity() {
        let dir = tempdir().unwrap();
        let device = Device::with_env(
            RedbKeyStore::open(dir.path().join("a.redb"), StorageKey::from_bytes([1; 32])).unwrap(),
            SimEnv::with_seed(4),
        );

        let mut out = Vec::new();
        assert!(matches!(device.bundle(&mut out), Err(CliError::Engine(_))));

        output(|out| device.init(20, out));
        let encoded = output(|out| device.bundle(out));
        assert!(hex::decode(encoded.trim()).is_ok());
    }
}
