//! Factory for opening the configured key material store.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::path::Path;
use std::sync::Arc;
use zeroize::Zeroizing;

use credvault_core::config::VaultSettings;
use credvault_core::error::{Result, VaultError};
use credvault_core::keystore::KeyMaterialStore;
use credvault_core::types::{KEY_LEN, KeyBytes};

use crate::local::LocalKeyStore;

/// Open the key store named by `settings.key_provider`.
///
/// Supported types:
/// - `"local"`: passphrase-encrypted keyfile at `keyfile_path`
pub fn open_key_store(
    settings: &VaultSettings,
    passphrase: &[u8],
) -> Result<Arc<dyn KeyMaterialStore>> {
    match settings.key_provider.as_str() {
        "local" => {
            let path = Path::new(&settings.keyfile_path);
            if !path.exists() {
                return Err(VaultError::Config(format!(
                    "no keyfile at {}, run `credvault init` first",
                    path.display()
                )));
            }
            let store = LocalKeyStore::open(path, Path::new(&settings.backup_dir), passphrase)?;
            Ok(Arc::new(store))
        }
        other => Err(VaultError::Config(format!("Unknown key provider type: {other}"))),
    }
}

/// Create a fresh key store with generation 1 active.
///
/// Bootstrap material is taken from `settings.bootstrap_key_env` when that
/// variable is set.
pub fn init_key_store(
    settings: &VaultSettings,
    passphrase: &[u8],
) -> Result<Arc<dyn KeyMaterialStore>> {
    match settings.key_provider.as_str() {
        "local" => {
            let initial = bootstrap_key_from_env(&settings.bootstrap_key_env)?;
            let store = LocalKeyStore::create(
                Path::new(&settings.keyfile_path),
                Path::new(&settings.backup_dir),
                passphrase,
                initial,
            )?;
            Ok(Arc::new(store))
        }
        other => Err(VaultError::Config(format!("Unknown key provider type: {other}"))),
    }
}

/// Read a base64 32-byte key from the environment. Unset or empty is `None`.
pub fn bootstrap_key_from_env(var: &str) -> Result<Option<KeyBytes>> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => {
            let value = Zeroizing::new(value);
            decode_key(value.trim())
                .map(Some)
                .map_err(|e| VaultError::Config(format!("{var}: {e}")))
        }
        _ => Ok(None),
    }
}

fn decode_key(encoded: &str) -> std::result::Result<KeyBytes, String> {
    let bytes = Zeroizing::new(BASE64.decode(encoded).map_err(|e| e.to_string())?);
    if bytes.len() != KEY_LEN {
        return Err(format!("bootstrap key must be {KEY_LEN} bytes, got {}", bytes.len()));
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&bytes);
    Ok(key)
}
