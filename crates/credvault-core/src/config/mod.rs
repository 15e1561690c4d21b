use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration stored as TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub vault: VaultSettings,
    #[serde(default)]
    pub rotation: RotationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSettings {
    /// Path to the SQLite database (credentials + rotation runs).
    pub db_path: String,
    /// Key provider type. Only "local" (encrypted keyfile) is built in.
    #[serde(default = "default_key_provider")]
    pub key_provider: String,
    /// Path to the encrypted keyfile.
    #[serde(default = "default_keyfile_path")]
    pub keyfile_path: String,
    /// Directory receiving retired key backups. Must not be the keyfile's own location.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    /// Environment variable that may carry a base64 bootstrap key for generation 1.
    #[serde(default = "default_bootstrap_key_env")]
    pub bootstrap_key_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationSettings {
    /// Days between scheduled rotations.
    #[serde(default = "default_interval_days")]
    pub interval_days: u64,
    /// Records re-encrypted per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Attempts at writing a key backup before the run fails.
    #[serde(default = "default_backup_max_attempts")]
    pub backup_max_attempts: u32,
    /// Delay before the first backup retry; doubles per attempt.
    #[serde(default = "default_backup_backoff_ms")]
    pub backup_backoff_ms: u64,
    /// Key generations kept before a warning is raised.
    #[serde(default = "default_max_key_history")]
    pub max_key_history: usize,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            interval_days: default_interval_days(),
            batch_size: default_batch_size(),
            backup_max_attempts: default_backup_max_attempts(),
            backup_backoff_ms: default_backup_backoff_ms(),
            max_key_history: default_max_key_history(),
        }
    }
}

impl RotationSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_days * 24 * 60 * 60)
    }

    pub fn backup_backoff(&self) -> Duration {
        Duration::from_millis(self.backup_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_days == 0 {
            return Err(VaultError::Config("rotation.interval_days must be >= 1".into()));
        }
        if self.batch_size == 0 {
            return Err(VaultError::Config("rotation.batch_size must be >= 1".into()));
        }
        if self.backup_max_attempts == 0 {
            return Err(VaultError::Config(
                "rotation.backup_max_attempts must be >= 1".into(),
            ));
        }
        if self.max_key_history < 2 {
            return Err(VaultError::Config(
                "rotation.max_key_history must be >= 2".into(),
            ));
        }
        Ok(())
    }
}

fn default_key_provider() -> String {
    "local".to_string()
}

fn default_keyfile_path() -> String {
    "keys.enc".to_string()
}

fn default_backup_dir() -> String {
    "key-backups".to_string()
}

fn default_bootstrap_key_env() -> String {
    "CREDVAULT_BOOTSTRAP_KEY".to_string()
}

fn default_interval_days() -> u64 {
    7
}

fn default_batch_size() -> usize {
    100
}

fn default_backup_max_attempts() -> u32 {
    3
}

fn default_backup_backoff_ms() -> u64 {
    200
}

fn default_max_key_history() -> usize {
    8
}

impl VaultConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(VaultError::ConfigNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| VaultError::TomlDe(e.to_string()))?;
        config.rotation.validate()?;
        Ok(config)
    }

    /// Save config to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| VaultError::TomlSer(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Default config for `credvault init`.
    pub fn default_config(base_dir: &Path) -> Self {
        Self {
            vault: VaultSettings {
                db_path: base_dir.join("credvault.db").display().to_string(),
                key_provider: default_key_provider(),
                keyfile_path: base_dir.join("keys.enc").display().to_string(),
                backup_dir: base_dir.join("key-backups").display().to_string(),
                bootstrap_key_env: default_bootstrap_key_env(),
            },
            rotation: RotationSettings::default(),
        }
    }

    /// Resolve the config file path: `<base_dir>/credvault.toml`
    pub fn default_path(base_dir: &Path) -> PathBuf {
        base_dir.join("credvault.toml")
    }

    /// Resolve the default home directory: `~/.credvault`
    pub fn default_base_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|h| h.join(".credvault"))
            .ok_or_else(|| VaultError::Config("Cannot determine home directory".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrip_config() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("credvault.toml");
        let config = VaultConfig::default_config(tmp.path());
        config.save(&path).unwrap();
        let loaded = VaultConfig::load(&path).unwrap();
        assert_eq!(loaded.vault.key_provider, "local");
        assert_eq!(loaded.rotation.batch_size, 100);
        assert_eq!(loaded.rotation.interval(), Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn load_nonexistent_returns_error() {
        let result = VaultConfig::load(Path::new("/nonexistent/credvault.toml"));
        assert!(matches!(result, Err(VaultError::ConfigNotFound(_))));
    }

    #[test]
    fn rotation_section_is_optional() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("credvault.toml");
        std::fs::write(&path, "[vault]\ndb_path = \"/tmp/x.db\"\n").unwrap();
        let loaded = VaultConfig::load(&path).unwrap();
        assert_eq!(loaded.rotation.backup_max_attempts, 3);
        assert_eq!(loaded.rotation.max_key_history, 8);
        assert_eq!(loaded.vault.bootstrap_key_env, "CREDVAULT_BOOTSTRAP_KEY");
    }

    #[test]
    fn zero_batch_size_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("credvault.toml");
        std::fs::write(
            &path,
            "[vault]\ndb_path = \"/tmp/x.db\"\n[rotation]\nbatch_size = 0\n",
        )
        .unwrap();
        assert!(matches!(
            VaultConfig::load(&path),
            Err(VaultError::Config(_))
        ));
    }
}
