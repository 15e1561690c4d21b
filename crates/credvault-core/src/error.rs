use thiserror::Error;

use crate::types::Generation;

#[derive(Debug, Error)]
pub enum VaultError {
    // IO
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Config
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found at {0} — run `credvault init` first")]
    ConfigNotFound(String),

    #[error("TOML deserialization error: {0}")]
    TomlDe(String),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    // Key material
    #[error("No active encryption key")]
    NoActiveKey,

    #[error("Unknown key generation {0}")]
    UnknownGeneration(Generation),

    #[error("Key generation {generation} is still referenced by {references} credential(s)")]
    GenerationInUse {
        generation: Generation,
        references: u64,
    },

    #[error("Key generation {0} has not been backed up")]
    GenerationNotBackedUp(Generation),

    #[error("Key generation {0} is active and cannot be pruned")]
    GenerationActive(Generation),

    #[error("Backup of key generation {generation} failed: {reason}")]
    BackupIo {
        generation: Generation,
        reason: String,
    },

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("A key rotation is already in progress")]
    ConcurrentRotation,

    // Crypto
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Authentication failed: wrong key or tampered ciphertext")]
    AuthenticationFailed,

    #[error("Malformed ciphertext: {0}")]
    MalformedInput(String),

    // Credentials
    #[error("Credential not found: {0}")]
    RecordNotFound(String),

    #[error("Credential {0} is system-protected")]
    ProtectedRecord(String),

    #[error("Rotation run not found: {0}")]
    RunNotFound(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    // Database
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    // Serialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VaultError {
    /// Failures confined to a single credential record. Re-encryption records
    /// these against the record and moves on; anything else aborts the pass.
    pub fn is_record_local(&self) -> bool {
        matches!(
            self,
            VaultError::AuthenticationFailed
                | VaultError::MalformedInput(_)
                | VaultError::UnknownGeneration(_)
                | VaultError::Encryption(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
