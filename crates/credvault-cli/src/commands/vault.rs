use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use credvault_core::config::VaultConfig;
use credvault_core::store::CredentialStore;
use credvault_rotation::{RotationManager, RotationPolicy};

/// Config plus an opened key store and credential database.
pub struct Vault {
    pub config: VaultConfig,
    pub store: Arc<CredentialStore>,
}

impl Vault {
    pub fn open(base_dir: &Path, cli_passphrase: &Option<String>) -> Result<Self> {
        let config_path = VaultConfig::default_path(base_dir);
        let config = VaultConfig::load(&config_path)?;

        let passphrase = crate::get_passphrase(cli_passphrase)?;
        let keys = credvault_keys::open_key_store(&config.vault, passphrase.as_bytes())
            .context("could not open the key store")?;
        let store = CredentialStore::open(Path::new(&config.vault.db_path), keys)?;

        Ok(Self {
            config,
            store: Arc::new(store),
        })
    }

    pub fn manager(&self) -> RotationManager {
        RotationManager::new(
            self.store.clone(),
            RotationPolicy::from(&self.config.rotation),
        )
    }
}
