//! Out-of-band backups of retired key generations.
//!
//! One file per generation, `key-gen-NNNNNN.bak`, holding the material
//! sealed with a backup key derived from the keyfile master key:
//!
//!   backup_key = HKDF-SHA256(master_key, salt, info="credvault-key-backup-v1")
//!
//! The artifact is restorable by anyone who can open the keyfile.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::io::Write;
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use credvault_core::crypto::{decrypt, encrypt, fingerprint};
use credvault_core::error::{Result, VaultError};
use credvault_core::types::{BackupHandle, Generation, KEY_LEN, KeyRecord, KeyStatus};

const BACKUP_INFO: &[u8] = b"credvault-key-backup-v1";
const ARTIFACT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct BackupArtifact {
    version: u32,
    generation: Generation,
    created_at: String,
    backed_up_at: String,
    fingerprint: String,
    /// Base64 of the sealed material.
    sealed: String,
}

/// Writes and reads key backups in a directory.
pub struct FileBackupTarget {
    dir: PathBuf,
    backup_key: Zeroizing<[u8; KEY_LEN]>,
}

impl FileBackupTarget {
    /// Derive the backup key from the master key and keyfile salt.
    pub fn new(dir: &Path, master_key: &[u8; KEY_LEN], salt: &[u8]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(salt), master_key);
        let mut backup_key = Zeroizing::new([0u8; KEY_LEN]);
        hk.expand(BACKUP_INFO, backup_key.as_mut())
            .map_err(|e| VaultError::KeyDerivation(format!("HKDF expansion failed: {e}")))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            backup_key,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, generation: Generation) -> PathBuf {
        self.dir.join(format!("key-gen-{:06}.bak", generation.0))
    }

    fn aad(generation: Generation) -> Vec<u8> {
        format!("key-backup:{generation}").into_bytes()
    }

    /// Write `key` to its backup file and read it back to confirm.
    ///
    /// An existing artifact holding the same material is left alone.
    pub fn write(&self, key: &KeyRecord) -> Result<BackupHandle> {
        let generation = key.generation;
        let path = self.path_for(generation);
        let io_err = |reason: String| VaultError::BackupIo { generation, reason };

        if path.exists() {
            if let Ok((existing, at)) = self.read_artifact(generation) {
                if existing.material.ct_eq(&key.material).into() {
                    return Ok(BackupHandle {
                        generation,
                        location: path.display().to_string(),
                        created_at: at,
                    });
                }
            }
        }

        std::fs::create_dir_all(&self.dir)
            .map_err(|e| io_err(format!("create {}: {e}", self.dir.display())))?;

        let sealed = encrypt(&key.material, &self.backup_key, &Self::aad(generation))?;
        let backed_up_at = credvault_core::types::now_timestamp();
        let artifact = BackupArtifact {
            version: ARTIFACT_VERSION,
            generation,
            created_at: key.created_at.clone(),
            backed_up_at: backed_up_at.clone(),
            fingerprint: fingerprint(&key.material),
            sealed: BASE64.encode(sealed),
        };
        let body = serde_json::to_vec_pretty(&artifact)?;

        let tmp = path.with_extension("bak.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &path)
        };
        write().map_err(|e| io_err(format!("write {}: {e}", path.display())))?;

        // The artifact only counts once it decrypts to the same material.
        let (check, _) = self.read_artifact(generation)?;
        if !bool::from(check.material.ct_eq(&key.material)) {
            return Err(io_err("verification read returned different material".into()));
        }

        Ok(BackupHandle {
            generation,
            location: path.display().to_string(),
            created_at: backed_up_at,
        })
    }

    /// Load a generation's material from its backup file.
    pub fn read(&self, generation: Generation) -> Result<KeyRecord> {
        self.read_artifact(generation).map(|(key, _)| key)
    }

    pub fn exists(&self, generation: Generation) -> bool {
        self.path_for(generation).exists()
    }

    fn read_artifact(&self, generation: Generation) -> Result<(KeyRecord, String)> {
        let path = self.path_for(generation);
        let data = std::fs::read(&path).map_err(|e| VaultError::BackupIo {
            generation,
            reason: format!("read {}: {e}", path.display()),
        })?;
        let artifact: BackupArtifact = serde_json::from_slice(&data)?;
        if artifact.version != ARTIFACT_VERSION || artifact.generation != generation {
            return Err(VaultError::MalformedInput(format!(
                "backup {} does not hold generation {generation}",
                path.display()
            )));
        }

        let sealed = BASE64
            .decode(artifact.sealed.as_bytes())
            .map_err(|e| VaultError::MalformedInput(format!("backup payload: {e}")))?;
        let plain = Zeroizing::new(decrypt(&sealed, &self.backup_key, &Self::aad(generation))?);
        let material: [u8; KEY_LEN] = plain
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::MalformedInput("backup material has wrong length".into()))?;

        let key = KeyRecord {
            generation,
            material,
            created_at: artifact.created_at,
            status: KeyStatus::BackedUp,
        };
        let expected = fingerprint(&key.material);
        if !bool::from(expected.as_bytes().ct_eq(artifact.fingerprint.as_bytes())) {
            return Err(VaultError::AuthenticationFailed);
        }
        Ok((key, artifact.backed_up_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(generation: u32, byte: u8) -> KeyRecord {
        KeyRecord {
            generation: Generation(generation),
            material: [byte; KEY_LEN],
            created_at: "2026-05-01T00:00:00.000000Z".to_string(),
            status: KeyStatus::Retired,
        }
    }

    #[test]
    fn write_then_read() {
        let tmp = TempDir::new().unwrap();
        let target = FileBackupTarget::new(&tmp.path().join("b"), &[1u8; KEY_LEN], b"salt").unwrap();

        let handle = target.write(&key(3, 0xaa)).unwrap();
        assert_eq!(handle.generation, Generation(3));
        assert!(handle.location.ends_with("key-gen-000003.bak"));

        let restored = target.read(Generation(3)).unwrap();
        assert_eq!(restored.material, [0xaa; KEY_LEN]);
        assert_eq!(restored.status, KeyStatus::BackedUp);
    }

    #[test]
    fn artifact_does_not_contain_raw_material() {
        let tmp = TempDir::new().unwrap();
        let target = FileBackupTarget::new(tmp.path(), &[1u8; KEY_LEN], b"salt").unwrap();
        target.write(&key(1, 0x5c)).unwrap();
        let raw = std::fs::read(target.path_for(Generation(1))).unwrap();
        assert!(!raw.windows(KEY_LEN).any(|w| w == [0x5c; KEY_LEN]));
        let encoded = BASE64.encode([0x5c; KEY_LEN]);
        assert!(!String::from_utf8_lossy(&raw).contains(&encoded));
    }

    #[test]
    fn repeated_write_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let target = FileBackupTarget::new(tmp.path(), &[1u8; KEY_LEN], b"salt").unwrap();
        let first = target.write(&key(2, 0x11)).unwrap();
        let second = target.write(&key(2, 0x11)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn wrong_master_key_cannot_restore() {
        let tmp = TempDir::new().unwrap();
        let writer = FileBackupTarget::new(tmp.path(), &[1u8; KEY_LEN], b"salt").unwrap();
        writer.write(&key(2, 0x11)).unwrap();

        let reader = FileBackupTarget::new(tmp.path(), &[2u8; KEY_LEN], b"salt").unwrap();
        assert!(matches!(
            reader.read(Generation(2)),
            Err(VaultError::AuthenticationFailed)
        ));
    }

    #[test]
    fn unwritable_directory_is_backup_io_error() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"file in the way").unwrap();
        let target = FileBackupTarget::new(&blocker, &[1u8; KEY_LEN], b"salt").unwrap();

        let result = target.write(&key(1, 0x22));
        assert!(matches!(
            result,
            Err(VaultError::BackupIo { generation: Generation(1), .. })
        ));
    }

    #[test]
    fn missing_backup_is_backup_io_error() {
        let tmp = TempDir::new().unwrap();
        let target = FileBackupTarget::new(tmp.path(), &[1u8; KEY_LEN], b"salt").unwrap();
        assert!(matches!(
            target.read(Generation(9)),
            Err(VaultError::BackupIo { .. })
        ));
    }
}
