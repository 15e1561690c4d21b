use argon2::Argon2;
use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use credvault_core::crypto::{decrypt, encrypt, fingerprint};
use credvault_core::error::{Result, VaultError};
use credvault_core::keystore::{
    GenerationReferences, KeyMaterialStore, PinnedKey, RotationFlag, RotationLease,
};
use credvault_core::types::{
    BackupHandle, Generation, KEY_LEN, KeyBytes, KeyInfo, KeyRecord, KeyStatus, now_timestamp,
};

use crate::backup::FileBackupTarget;

const KEYRING_VERSION: u32 = 1;
const SALT_LEN: usize = 32;
const KEYRING_AAD: &[u8] = b"credvault-keyring";
const KEYRING_LOCK_SUFFIX: &str = ".lock";
const ROTATION_LOCK_SUFFIX: &str = ".rotation.lock";

/// Key material store backed by a passphrase-encrypted keyfile.
///
/// The keyfile holds every retained generation as a JSON keyring sealed with
/// AES-256-GCM under an Argon2id master key:
///
///   keyfile = salt (32) ‖ 0x01 ‖ nonce (12) ‖ ciphertext+tag
///
/// Every mutation is applied to a copy of the keyring, written to a
/// temporary file and renamed over the keyfile. The in-memory keyring only
/// changes once the rename succeeded, so a failed write leaves both the
/// file and the process state at the previous version.
///
/// Several handles, in one process or many, may share a keyfile. Two
/// advisory locks next to it keep them consistent:
///
/// - `<keyfile>.lock`: exclusive for every read-modify-write of the
///   keyring, shared for reads and while a writer has the Active key
///   pinned. Every read reloads the keyring from disk under it.
/// - `<keyfile>.rotation.lock`: held for the lifetime of a rotation lease.
pub struct LocalKeyStore {
    keyfile_path: PathBuf,
    salt: [u8; SALT_LEN],
    master_key: Zeroizing<[u8; KEY_LEN]>,
    keyring: Mutex<Keyring>,
    backups: FileBackupTarget,
    flag: RotationFlag,
}

#[derive(Clone, Serialize, Deserialize)]
struct Keyring {
    /// Version for forward compatibility.
    version: u32,
    /// Argon2id salt, also written in clear at the head of the keyfile.
    salt: [u8; SALT_LEN],
    /// Ordered by generation.
    keys: Vec<StoredKey>,
}

#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
struct StoredKey {
    #[zeroize(skip)]
    generation: Generation,
    #[serde(with = "base64_material")]
    key: [u8; KEY_LEN],
    #[zeroize(skip)]
    created_at: String,
    #[zeroize(skip)]
    status: KeyStatus,
}

impl StoredKey {
    fn to_record(&self) -> KeyRecord {
        KeyRecord {
            generation: self.generation,
            material: self.key,
            created_at: self.created_at.clone(),
            status: self.status,
        }
    }

    fn to_info(&self) -> KeyInfo {
        KeyInfo {
            generation: self.generation,
            status: self.status,
            created_at: self.created_at.clone(),
            fingerprint: fingerprint(&self.key),
        }
    }
}

impl Keyring {
    fn find(&self, generation: Generation) -> Option<&StoredKey> {
        self.keys.iter().find(|k| k.generation == generation)
    }

    fn find_mut(&mut self, generation: Generation) -> Option<&mut StoredKey> {
        self.keys.iter_mut().find(|k| k.generation == generation)
    }

    fn active(&self) -> Option<&StoredKey> {
        self.keys.iter().find(|k| k.status == KeyStatus::Active)
    }
}

#[derive(Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn open_lock_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

fn lock_file(path: &Path, mode: LockMode) -> Result<File> {
    let file = open_lock_file(path)?;
    match mode {
        LockMode::Shared => FileExt::lock_shared(&file)?,
        LockMode::Exclusive => FileExt::lock_exclusive(&file)?,
    }
    Ok(file)
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Serde helper for key material as base64.
mod base64_material {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use zeroize::Zeroizing;

    use credvault_core::types::KEY_LEN;

    pub fn serialize<S: Serializer>(bytes: &[u8; KEY_LEN], s: S) -> Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(BASE64.encode(bytes));
        encoded.as_str().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; KEY_LEN], D::Error> {
        use serde::de::Error;
        let s = Zeroizing::new(String::deserialize(d)?);
        let bytes = Zeroizing::new(BASE64.decode(s.as_bytes()).map_err(D::Error::custom)?);
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| D::Error::custom("key material must be 32 bytes"))
    }
}

impl LocalKeyStore {
    /// Derive a master key from passphrase using Argon2id.
    fn derive_master_key(passphrase: &[u8], salt: &[u8; SALT_LEN]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        Argon2::default()
            .hash_password_into(passphrase, salt, key.as_mut())
            .map_err(|e| VaultError::KeyDerivation(format!("Argon2id key derivation failed: {e}")))?;
        Ok(key)
    }

    fn seal_keyring(keyring: &Keyring, master_key: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
        let plaintext = Zeroizing::new(serde_json::to_vec(keyring)?);
        let sealed = encrypt(&plaintext, master_key, KEYRING_AAD)?;
        let mut output = Vec::with_capacity(SALT_LEN + sealed.len());
        output.extend_from_slice(&keyring.salt);
        output.extend_from_slice(&sealed);
        Ok(output)
    }

    fn open_keyring(data: &[u8], passphrase: &[u8]) -> Result<(Keyring, Zeroizing<[u8; KEY_LEN]>)> {
        if data.len() <= SALT_LEN {
            return Err(VaultError::MalformedInput("keyfile too short".into()));
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&data[..SALT_LEN]);

        let master_key = Self::derive_master_key(passphrase, &salt)?;
        let keyring = Self::unseal_keyring(&data[SALT_LEN..], &master_key)?;
        Ok((keyring, master_key))
    }

    fn unseal_keyring(sealed: &[u8], master_key: &[u8; KEY_LEN]) -> Result<Keyring> {
        let plaintext = Zeroizing::new(decrypt(sealed, master_key, KEYRING_AAD)?);
        let keyring: Keyring = serde_json::from_slice(&plaintext)?;
        if keyring.version != KEYRING_VERSION {
            return Err(VaultError::Config(format!(
                "unsupported keyfile version {}",
                keyring.version
            )));
        }
        Ok(keyring)
    }

    fn check_backup_location(keyfile_path: &Path, backup_dir: &Path) -> Result<()> {
        if backup_dir == keyfile_path || keyfile_path.parent() == Some(backup_dir) {
            return Err(VaultError::Config(format!(
                "backup_dir {} must be separate from the keyfile location",
                backup_dir.display()
            )));
        }
        Ok(())
    }

    /// Create a new keyfile holding generation 1.
    ///
    /// `initial` supplies the bootstrap material; a random key is generated
    /// when it is absent.
    pub fn create(
        keyfile_path: &Path,
        backup_dir: &Path,
        passphrase: &[u8],
        initial: Option<KeyBytes>,
    ) -> Result<Self> {
        if keyfile_path.exists() {
            return Err(VaultError::Config(format!(
                "keyfile already exists at {}",
                keyfile_path.display()
            )));
        }
        Self::check_backup_location(keyfile_path, backup_dir)?;

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let master_key = Self::derive_master_key(passphrase, &salt)?;

        let material = initial.unwrap_or_else(|| {
            let mut material = Zeroizing::new([0u8; KEY_LEN]);
            OsRng.fill_bytes(material.as_mut());
            material
        });
        let keyring = Keyring {
            version: KEYRING_VERSION,
            salt,
            keys: vec![StoredKey {
                generation: Generation::FIRST,
                key: *material,
                created_at: now_timestamp(),
                status: KeyStatus::Active,
            }],
        };

        let store = Self {
            keyfile_path: keyfile_path.to_path_buf(),
            salt,
            backups: FileBackupTarget::new(backup_dir, &master_key, &salt)?,
            master_key,
            keyring: Mutex::new(keyring.clone()),
            flag: RotationFlag::new(),
        };
        if let Some(parent) = keyfile_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _file = store.lock_keyring(LockMode::Exclusive)?;
        if keyfile_path.exists() {
            return Err(VaultError::Config(format!(
                "keyfile already exists at {}",
                keyfile_path.display()
            )));
        }
        store.persist(&keyring)?;
        info!(path = %keyfile_path.display(), "keyfile created with generation 1");
        Ok(store)
    }

    /// Open an existing keyfile. Fails if no generation is Active.
    pub fn open(keyfile_path: &Path, backup_dir: &Path, passphrase: &[u8]) -> Result<Self> {
        Self::check_backup_location(keyfile_path, backup_dir)?;
        let data = {
            let _file = lock_file(&sibling(keyfile_path, KEYRING_LOCK_SUFFIX), LockMode::Shared)?;
            std::fs::read(keyfile_path)?
        };
        let (keyring, master_key) = Self::open_keyring(&data, passphrase)?;

        let active = keyring
            .keys
            .iter()
            .filter(|k| k.status == KeyStatus::Active)
            .count();
        match active {
            0 => return Err(VaultError::NoActiveKey),
            1 => {}
            n => {
                return Err(VaultError::Config(format!(
                    "keyfile has {n} active generations"
                )));
            }
        }

        debug!(
            path = %keyfile_path.display(),
            generations = keyring.keys.len(),
            "keyfile opened"
        );
        Ok(Self {
            keyfile_path: keyfile_path.to_path_buf(),
            salt: keyring.salt,
            backups: FileBackupTarget::new(backup_dir, &master_key, &keyring.salt)?,
            master_key,
            keyring: Mutex::new(keyring),
            flag: RotationFlag::new(),
        })
    }

    pub fn keyfile_path(&self) -> &Path {
        &self.keyfile_path
    }

    pub fn backup_dir(&self) -> &Path {
        self.backups.dir()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Keyring>> {
        self.keyring
            .lock()
            .map_err(|_| VaultError::LockPoisoned("keyring"))
    }

    /// Write the keyring to a temporary file, then rename it into place.
    fn persist(&self, keyring: &Keyring) -> Result<()> {
        let data = Self::seal_keyring(keyring, &self.master_key)?;
        if let Some(parent) = self.keyfile_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.keyfile_path.with_extension("enc.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
            }
            file.write_all(&data)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.keyfile_path)?;
        Ok(())
    }

    fn lock_keyring(&self, mode: LockMode) -> Result<File> {
        lock_file(&sibling(&self.keyfile_path, KEYRING_LOCK_SUFFIX), mode)
    }

    /// Read and decrypt the keyfile. The caller holds the keyring lock.
    fn load(&self) -> Result<Keyring> {
        let data = std::fs::read(&self.keyfile_path)?;
        if data.len() <= SALT_LEN {
            return Err(VaultError::MalformedInput("keyfile too short".into()));
        }
        if data[..SALT_LEN] != self.salt {
            return Err(VaultError::Config(format!(
                "keyfile {} was replaced by a different keyring",
                self.keyfile_path.display()
            )));
        }
        Self::unseal_keyring(&data[SALT_LEN..], &self.master_key)
    }

    /// The keyring as it is on disk now.
    fn refresh(&self) -> Result<MutexGuard<'_, Keyring>> {
        let mut guard = self.lock()?;
        let _file = self.lock_keyring(LockMode::Shared)?;
        *guard = self.load()?;
        Ok(guard)
    }

    /// Apply `f` to a fresh copy of the on-disk keyring and persist it, all
    /// under the exclusive keyring lock. The live keyring is only replaced
    /// after the write succeeded.
    fn update<T>(&self, f: impl FnOnce(&mut Keyring) -> Result<T>) -> Result<T> {
        let mut guard = self.lock()?;
        let _file = self.lock_keyring(LockMode::Exclusive)?;
        *guard = self.load()?;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        self.persist(&next)?;
        *guard = next;
        Ok(out)
    }

    /// In-process flag first, then the rotation lock file.
    fn lease(&self) -> Result<RotationLease> {
        let lease = self.flag.try_acquire()?;
        let file = open_lock_file(&sibling(&self.keyfile_path, ROTATION_LOCK_SUFFIX))?;
        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            if is_contended(&e) {
                debug!(path = %self.keyfile_path.display(), "rotation lock held by another handle");
                return Err(VaultError::ConcurrentRotation);
            }
            return Err(e.into());
        }
        Ok(lease.holding(file))
    }
}

#[async_trait]
impl KeyMaterialStore for LocalKeyStore {
    async fn get_active(&self) -> Result<KeyRecord> {
        self.refresh()?
            .active()
            .map(StoredKey::to_record)
            .ok_or(VaultError::NoActiveKey)
    }

    async fn get(&self, generation: Generation) -> Result<KeyRecord> {
        self.refresh()?
            .find(generation)
            .map(StoredKey::to_record)
            .ok_or(VaultError::UnknownGeneration(generation))
    }

    async fn pin_active(&self) -> Result<PinnedKey> {
        let (key, file) = {
            let mut guard = self.lock()?;
            let file = self.lock_keyring(LockMode::Shared)?;
            *guard = self.load()?;
            let key = guard
                .active()
                .map(StoredKey::to_record)
                .ok_or(VaultError::NoActiveKey)?;
            (key, file)
        };
        Ok(PinnedKey::new(key, Some(Box::new(file))))
    }

    async fn create_and_activate(&self, material: KeyBytes) -> Result<(KeyRecord, RotationLease)> {
        let lease = self.lease()?;
        let record = self
            .update(|ring| {
                let generation = ring
                    .keys
                    .iter()
                    .map(|k| k.generation)
                    .max()
                    .map_or(Generation::FIRST, Generation::next);
                for key in ring.keys.iter_mut() {
                    if key.status == KeyStatus::Active {
                        key.status = KeyStatus::Retired;
                    }
                }
                let stored = StoredKey {
                    generation,
                    key: *material,
                    created_at: now_timestamp(),
                    status: KeyStatus::Active,
                };
                let record = stored.to_record();
                ring.keys.push(stored);
                Ok(record)
            })
            .inspect_err(|e| warn!(error = %e, "key activation not persisted, keyring unchanged"))?;

        info!(generation = %record.generation, "key generation activated");
        Ok((record, lease))
    }

    fn acquire_rotation(&self) -> Result<RotationLease> {
        self.lease()
    }

    fn rotation_in_progress(&self) -> bool {
        self.flag.is_held()
    }

    async fn backup(&self, generation: Generation) -> Result<BackupHandle> {
        let record = {
            let ring = self.refresh()?;
            let key = ring
                .find(generation)
                .ok_or(VaultError::UnknownGeneration(generation))?;
            if key.status == KeyStatus::Active {
                return Err(VaultError::GenerationActive(generation));
            }
            key.to_record()
        };

        let handle = self.backups.write(&record)?;
        self.update(|ring| {
            if let Some(key) = ring.find_mut(generation) {
                key.status = KeyStatus::BackedUp;
            }
            Ok(())
        })
        .map_err(|e| VaultError::BackupIo {
            generation,
            reason: format!("backup written but keyfile not updated: {e}"),
        })?;

        info!(generation = %generation, location = %handle.location, "key generation backed up");
        Ok(handle)
    }

    async fn restore(&self, generation: Generation) -> Result<KeyInfo> {
        if let Some(key) = self.refresh()?.find(generation) {
            return Ok(key.to_info());
        }

        let restored = self.backups.read(generation)?;
        let stored = StoredKey {
            generation,
            key: restored.material,
            created_at: restored.created_at.clone(),
            status: KeyStatus::BackedUp,
        };
        let info = stored.to_info();
        self.update(|ring| {
            if ring.find(generation).is_none() {
                ring.keys.push(stored);
                ring.keys.sort_by_key(|k| k.generation);
            }
            Ok(())
        })?;

        info!(generation = %generation, "key generation restored from backup");
        Ok(info)
    }

    async fn prune(&self, generation: Generation, refs: &dyn GenerationReferences) -> Result<()> {
        // Checked under the exclusive lock: a writer pinning the Active key
        // cannot add a reference in between.
        self.update(|ring| {
            let status = ring
                .find(generation)
                .map(|k| k.status)
                .ok_or(VaultError::UnknownGeneration(generation))?;
            match status {
                KeyStatus::Active => return Err(VaultError::GenerationActive(generation)),
                KeyStatus::Retired => return Err(VaultError::GenerationNotBackedUp(generation)),
                KeyStatus::BackedUp => {}
            }
            if !self.backups.exists(generation) {
                return Err(VaultError::GenerationNotBackedUp(generation));
            }
            let references = refs.references(generation)?;
            if references > 0 {
                return Err(VaultError::GenerationInUse {
                    generation,
                    references,
                });
            }
            ring.keys.retain(|k| k.generation != generation);
            Ok(())
        })?;

        info!(generation = %generation, "key generation pruned");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<KeyInfo>> {
        Ok(self.refresh()?.keys.iter().map(StoredKey::to_info).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct FixedRefs(u64);

    impl GenerationReferences for FixedRefs {
        fn references(&self, _generation: Generation) -> Result<u64> {
            Ok(self.0)
        }
    }

    fn material(byte: u8) -> KeyBytes {
        Zeroizing::new([byte; KEY_LEN])
    }

    fn paths(tmp: &TempDir) -> (PathBuf, PathBuf) {
        (tmp.path().join("keys.enc"), tmp.path().join("backups"))
    }

    #[tokio::test]
    async fn create_and_open_keyfile() {
        let tmp = TempDir::new().unwrap();
        let (keyfile, backups) = paths(&tmp);
        let passphrase = b"test-passphrase-123";

        let store = LocalKeyStore::create(&keyfile, &backups, passphrase, None).unwrap();
        let key1 = store.get_active().await.unwrap();
        assert_eq!(key1.generation, Generation::FIRST);

        let reopened = LocalKeyStore::open(&keyfile, &backups, passphrase).unwrap();
        let key2 = reopened.get_active().await.unwrap();
        assert_eq!(key1.generation, key2.generation);
        assert_eq!(key1.material, key2.material);
    }

    #[tokio::test]
    async fn bootstrap_material_is_used() {
        let tmp = TempDir::new().unwrap();
        let (keyfile, backups) = paths(&tmp);
        let store = LocalKeyStore::create(&keyfile, &backups, b"pass", Some(material(7))).unwrap();
        assert_eq!(store.get_active().await.unwrap().material, [7; KEY_LEN]);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let tmp = TempDir::new().unwrap();
        let (keyfile, backups) = paths(&tmp);
        LocalKeyStore::create(&keyfile, &backups, b"correct", None).unwrap();
        assert!(matches!(
            LocalKeyStore::open(&keyfile, &backups, b"wrong"),
            Err(VaultError::AuthenticationFailed)
        ));
    }

    #[test]
    fn keyfile_does_not_contain_material() {
        let tmp = TempDir::new().unwrap();
        let (keyfile, backups) = paths(&tmp);
        LocalKeyStore::create(&keyfile, &backups, b"pass", Some(material(0x42))).unwrap();
        let raw = std::fs::read(&keyfile).unwrap();
        assert!(!raw.windows(KEY_LEN).any(|w| w == [0x42; KEY_LEN]));
    }

    #[test]
    fn backup_dir_must_differ_from_keyfile_dir() {
        let tmp = TempDir::new().unwrap();
        let keyfile = tmp.path().join("keys.enc");
        assert!(matches!(
            LocalKeyStore::create(&keyfile, tmp.path(), b"pass", None),
            Err(VaultError::Config(_))
        ));
    }

    #[tokio::test]
    async fn activation_retires_previous_generation() {
        let tmp = TempDir::new().unwrap();
        let (keyfile, backups) = paths(&tmp);
        let store = LocalKeyStore::create(&keyfile, &backups, b"pass", None).unwrap();

        let (record, lease) = store.create_and_activate(material(2)).await.unwrap();
        assert_eq!(record.generation, Generation(2));
        assert!(store.rotation_in_progress());
        drop(lease);
        assert!(!store.rotation_in_progress());

        let keys = store.list().await.unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].status, KeyStatus::Retired);
        assert_eq!(keys[1].status, KeyStatus::Active);

        let reopened = LocalKeyStore::open(&keyfile, &backups, b"pass").unwrap();
        assert_eq!(reopened.get_active().await.unwrap().generation, Generation(2));
        assert_eq!(reopened.get(Generation(1)).await.unwrap().status, KeyStatus::Retired);
    }

    #[tokio::test]
    async fn second_activation_while_leased_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let (keyfile, backups) = paths(&tmp);
        let store = LocalKeyStore::create(&keyfile, &backups, b"pass", None).unwrap();

        let _lease = store.acquire_rotation().unwrap();
        assert!(matches!(
            store.create_and_activate(material(3)).await,
            Err(VaultError::ConcurrentRotation)
        ));
        assert_eq!(store.get_active().await.unwrap().generation, Generation::FIRST);
    }

    #[tokio::test]
    async fn handles_on_one_keyfile_share_the_rotation_lock() {
        let tmp = TempDir::new().unwrap();
        let (keyfile, backups) = paths(&tmp);
        let a = LocalKeyStore::create(&keyfile, &backups, b"pass", Some(material(1))).unwrap();
        let b = LocalKeyStore::open(&keyfile, &backups, b"pass").unwrap();

        let (activated, lease) = a.create_and_activate(material(2)).await.unwrap();
        assert_eq!(activated.generation, Generation(2));
        assert!(matches!(
            b.create_and_activate(material(3)).await,
            Err(VaultError::ConcurrentRotation)
        ));
        assert!(matches!(b.acquire_rotation(), Err(VaultError::ConcurrentRotation)));
        drop(lease);

        // b was opened before the activation and still sees it.
        assert_eq!(b.get_active().await.unwrap().material, [2; KEY_LEN]);
        let (next, _lease) = b.create_and_activate(material(3)).await.unwrap();
        assert_eq!(next.generation, Generation(3));

        // Nothing a wrote was overwritten by b.
        let reopened = LocalKeyStore::open(&keyfile, &backups, b"pass").unwrap();
        let keys = reopened.list().await.unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(reopened.get(Generation(2)).await.unwrap().material, [2; KEY_LEN]);
        assert_eq!(reopened.get(Generation(2)).await.unwrap().status, KeyStatus::Retired);
        assert_eq!(reopened.get_active().await.unwrap().generation, Generation(3));
    }

    #[tokio::test]
    async fn changes_from_another_handle_are_seen() {
        let tmp = TempDir::new().unwrap();
        let (keyfile, backups) = paths(&tmp);
        let a = LocalKeyStore::create(&keyfile, &backups, b"pass", Some(material(1))).unwrap();
        let b = LocalKeyStore::open(&keyfile, &backups, b"pass").unwrap();
        assert_eq!(b.pin_active().await.unwrap().key().generation, Generation::FIRST);

        let (_, lease) = a.create_and_activate(material(2)).await.unwrap();
        drop(lease);
        a.backup(Generation(1)).await.unwrap();
        a.prune(Generation(1), &FixedRefs(0)).await.unwrap();

        let pinned = b.pin_active().await.unwrap();
        assert_eq!(pinned.key().generation, Generation(2));
        drop(pinned);
        assert!(matches!(
            b.get(Generation(1)).await,
            Err(VaultError::UnknownGeneration(_))
        ));

        // b restores from the backup a wrote.
        b.restore(Generation(1)).await.unwrap();
        assert_eq!(a.get(Generation(1)).await.unwrap().material, [1; KEY_LEN]);
    }

    #[tokio::test]
    async fn failed_write_keeps_previous_keyring() {
        let tmp = TempDir::new().unwrap();
        let (keyfile, backups) = paths(&tmp);
        let store = LocalKeyStore::create(&keyfile, &backups, b"pass", None).unwrap();

        // A directory where the temporary keyfile goes makes the write fail.
        std::fs::create_dir(keyfile.with_extension("enc.tmp")).unwrap();
        assert!(store.create_and_activate(material(9)).await.is_err());
        assert!(!store.rotation_in_progress());

        let active = store.get_active().await.unwrap();
        assert_eq!(active.generation, Generation::FIRST);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backup_prune_restore_cycle() {
        let tmp = TempDir::new().unwrap();
        let (keyfile, backups) = paths(&tmp);
        let store = LocalKeyStore::create(&keyfile, &backups, b"pass", Some(material(1))).unwrap();
        let (_, lease) = store.create_and_activate(material(2)).await.unwrap();
        drop(lease);

        // Retired but not yet backed up.
        assert!(matches!(
            store.prune(Generation(1), &FixedRefs(0)).await,
            Err(VaultError::GenerationNotBackedUp(_))
        ));

        let handle = store.backup(Generation(1)).await.unwrap();
        assert!(Path::new(&handle.location).exists());
        assert_eq!(store.get(Generation(1)).await.unwrap().status, KeyStatus::BackedUp);

        assert!(matches!(
            store.prune(Generation(1), &FixedRefs(4)).await,
            Err(VaultError::GenerationInUse { references: 4, .. })
        ));

        store.prune(Generation(1), &FixedRefs(0)).await.unwrap();
        assert!(matches!(
            store.get(Generation(1)).await,
            Err(VaultError::UnknownGeneration(_))
        ));

        let info = store.restore(Generation(1)).await.unwrap();
        assert_eq!(info.status, KeyStatus::BackedUp);
        assert_eq!(store.get(Generation(1)).await.unwrap().material, [1; KEY_LEN]);

        // Restoring a present generation is a no-op.
        assert_eq!(store.restore(Generation(1)).await.unwrap(), info);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn active_generation_cannot_be_backed_up_or_pruned() {
        let tmp = TempDir::new().unwrap();
        let (keyfile, backups) = paths(&tmp);
        let store = LocalKeyStore::create(&keyfile, &backups, b"pass", None).unwrap();
        assert!(matches!(
            store.backup(Generation::FIRST).await,
            Err(VaultError::GenerationActive(_))
        ));
        assert!(matches!(
            store.prune(Generation::FIRST, &FixedRefs(0)).await,
            Err(VaultError::GenerationActive(_))
        ));
        assert!(matches!(
            store.prune(Generation(5), &FixedRefs(0)).await,
            Err(VaultError::UnknownGeneration(_))
        ));
    }

    #[tokio::test]
    async fn backup_failure_leaves_generation_retired() {
        let tmp = TempDir::new().unwrap();
        let keyfile = tmp.path().join("keys.enc");
        let blocker = tmp.path().join("blocked");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let store = LocalKeyStore::create(&keyfile, &blocker, b"pass", None).unwrap();
        let (_, lease) = store.create_and_activate(material(2)).await.unwrap();
        drop(lease);

        assert!(matches!(
            store.backup(Generation(1)).await,
            Err(VaultError::BackupIo { .. })
        ));
        assert_eq!(store.get(Generation(1)).await.unwrap().status, KeyStatus::Retired);
    }
}
