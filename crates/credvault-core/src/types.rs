use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use zeroize::{Zeroizing, ZeroizeOnDrop};

use crate::error::VaultError;

/// Size of symmetric key material in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Monotonic identifier of one version of the encryption key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(pub u32);

impl Generation {
    pub const FIRST: Generation = Generation(1);

    pub fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Generation {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .ok()
            .filter(|g| *g >= 1)
            .map(Generation)
            .ok_or_else(|| VaultError::Config(format!("invalid key generation: {s}")))
    }
}

impl ToSql for Generation {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(i64::from(self.0)))
    }
}

impl FromSql for Generation {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_i64()?;
        u32::try_from(raw)
            .map(Generation)
            .map_err(|_| FromSqlError::OutOfRange(raw))
    }
}

/// Lifecycle state of a key generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Retired,
    BackedUp,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStatus::Active => write!(f, "active"),
            KeyStatus::Retired => write!(f, "retired"),
            KeyStatus::BackedUp => write!(f, "backed_up"),
        }
    }
}

/// One generation of key material — zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct KeyRecord {
    #[zeroize(skip)]
    pub generation: Generation,
    pub material: [u8; KEY_LEN],
    #[zeroize(skip)]
    pub created_at: String,
    #[zeroize(skip)]
    pub status: KeyStatus,
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("generation", &self.generation)
            .field("material", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .field("status", &self.status)
            .finish()
    }
}

/// Fresh key material handed to `create_and_activate`.
pub type KeyBytes = Zeroizing<[u8; KEY_LEN]>;

/// Key metadata safe to display: never carries material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub generation: Generation,
    pub status: KeyStatus,
    pub created_at: String,
    /// First 8 bytes of SHA-256 over the material, hex-encoded.
    pub fingerprint: String,
}

/// Where a retired key's material was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupHandle {
    pub generation: Generation,
    pub location: String,
    pub created_at: String,
}

/// Stored device credential. The secret only exists here as ciphertext.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub id: String,
    pub device_scope: String,
    pub username: String,
    pub secret_ciphertext: Vec<u8>,
    pub key_generation: Generation,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_used_at: Option<String>,
    pub priority: i64,
    pub is_system_protected: bool,
    pub created_at: String,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("device_scope", &self.device_scope)
            .field("username", &self.username)
            .field("ciphertext_len", &self.secret_ciphertext.len())
            .field("key_generation", &self.key_generation)
            .field("success_count", &self.success_count)
            .field("failure_count", &self.failure_count)
            .field("last_used_at", &self.last_used_at)
            .field("priority", &self.priority)
            .field("is_system_protected", &self.is_system_protected)
            .finish()
    }
}

/// Device scope that matches every device.
pub const GLOBAL_SCOPE: &str = "*";

/// Input for provisioning a credential.
pub struct NewCredential {
    pub id: Option<String>,
    pub device_scope: String,
    pub username: String,
    pub secret: Zeroizing<String>,
    pub priority: i64,
    pub is_system_protected: bool,
}

impl NewCredential {
    pub fn new(device_scope: &str, username: &str, secret: &str) -> Self {
        Self {
            id: None,
            device_scope: device_scope.to_string(),
            username: username.to_string(),
            secret: Zeroizing::new(secret.to_string()),
            priority: 0,
            is_system_protected: false,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn protected(mut self) -> Self {
        self.is_system_protected = true;
        self
    }
}

/// Terminal and non-terminal states of a rotation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStatus {
    Running,
    Completed,
    CompletedWithErrors,
    RolledBack,
    Failed,
}

impl RotationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RotationStatus::Running)
    }
}

impl fmt::Display for RotationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationStatus::Running => write!(f, "running"),
            RotationStatus::Completed => write!(f, "completed"),
            RotationStatus::CompletedWithErrors => write!(f, "completed_with_errors"),
            RotationStatus::RolledBack => write!(f, "rolled_back"),
            RotationStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RotationStatus {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RotationStatus::Running),
            "completed" => Ok(RotationStatus::Completed),
            "completed_with_errors" => Ok(RotationStatus::CompletedWithErrors),
            "rolled_back" => Ok(RotationStatus::RolledBack),
            "failed" => Ok(RotationStatus::Failed),
            _ => Err(VaultError::InvalidStatus(s.to_string())),
        }
    }
}

/// Step of the rotation state machine a run is in (or stopped at).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationPhase {
    Idle,
    GeneratingKey,
    Activating,
    ReEncrypting,
    BackingUpOldKey,
    Pruning,
    Done,
    Failed,
}

impl fmt::Display for RotationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationPhase::Idle => write!(f, "idle"),
            RotationPhase::GeneratingKey => write!(f, "generating_key"),
            RotationPhase::Activating => write!(f, "activating"),
            RotationPhase::ReEncrypting => write!(f, "re_encrypting"),
            RotationPhase::BackingUpOldKey => write!(f, "backing_up_old_key"),
            RotationPhase::Pruning => write!(f, "pruning"),
            RotationPhase::Done => write!(f, "done"),
            RotationPhase::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RotationPhase {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(RotationPhase::Idle),
            "generating_key" => Ok(RotationPhase::GeneratingKey),
            "activating" => Ok(RotationPhase::Activating),
            "re_encrypting" => Ok(RotationPhase::ReEncrypting),
            "backing_up_old_key" => Ok(RotationPhase::BackingUpOldKey),
            "pruning" => Ok(RotationPhase::Pruning),
            "done" => Ok(RotationPhase::Done),
            "failed" => Ok(RotationPhase::Failed),
            _ => Err(VaultError::InvalidStatus(s.to_string())),
        }
    }
}

/// Summary of one rotation run, persisted for audit and resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationRun {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub from_generations: Vec<Generation>,
    pub to_generation: Option<Generation>,
    pub total_records: u64,
    pub processed_records: u64,
    pub failed_record_ids: BTreeSet<String>,
    pub status: RotationStatus,
    pub phase: RotationPhase,
    pub backed_up: Vec<Generation>,
    pub pruned: Vec<Generation>,
    /// Old generations kept because records still reference them.
    pub retained: Vec<Generation>,
    pub error: Option<String>,
}

impl RotationRun {
    pub fn start() -> Self {
        Self {
            run_id: uuid::Uuid::now_v7().to_string(),
            started_at: now_timestamp(),
            finished_at: None,
            from_generations: vec![],
            to_generation: None,
            total_records: 0,
            processed_records: 0,
            failed_record_ids: BTreeSet::new(),
            status: RotationStatus::Running,
            phase: RotationPhase::Idle,
            backed_up: vec![],
            pruned: vec![],
            retained: vec![],
            error: None,
        }
    }

    pub fn finish(&mut self, status: RotationStatus) {
        self.status = status;
        self.finished_at = Some(now_timestamp());
    }
}

/// UTC timestamp with fixed-width formatting so lexical order is time order.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_parse() {
        assert_eq!("3".parse::<Generation>().unwrap(), Generation(3));
        assert!("0".parse::<Generation>().is_err());
        assert!("abc".parse::<Generation>().is_err());
        assert_eq!(Generation::FIRST.next(), Generation(2));
    }

    #[test]
    fn rotation_status_roundtrip() {
        for status in [
            RotationStatus::Running,
            RotationStatus::Completed,
            RotationStatus::CompletedWithErrors,
            RotationStatus::RolledBack,
            RotationStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<RotationStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<RotationStatus>().is_err());
        assert!(!RotationStatus::Running.is_terminal());
        assert!(RotationStatus::CompletedWithErrors.is_terminal());
    }

    #[test]
    fn key_record_debug_is_redacted() {
        let key = KeyRecord {
            generation: Generation(1),
            material: [0x42; KEY_LEN],
            created_at: "2026-01-01T00:00:00.000000Z".to_string(),
            status: KeyStatus::Active,
        };
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("66"));
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = now_timestamp();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_timestamp();
        assert!(a < b);
    }
}
