use anyhow::Result;
use std::path::Path;

use credvault_core::config::VaultConfig;
use credvault_core::store::CredentialStore;

pub fn run(base_dir: &Path, cli_passphrase: &Option<String>) -> Result<()> {
    println!("Initializing credvault in {}", base_dir.display());

    std::fs::create_dir_all(base_dir)?;

    let config_path = VaultConfig::default_path(base_dir);
    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
    } else {
        let config = VaultConfig::default_config(base_dir);
        config.save(&config_path)?;
        println!("Created config: {}", config_path.display());
    }

    let config = VaultConfig::load(&config_path)?;
    let passphrase = crate::get_passphrase(cli_passphrase)?;

    let keyfile_path = Path::new(&config.vault.keyfile_path);
    let keys = if keyfile_path.exists() {
        println!("Keyfile already exists: {}", keyfile_path.display());
        credvault_keys::open_key_store(&config.vault, passphrase.as_bytes())?
    } else {
        let keys = credvault_keys::init_key_store(&config.vault, passphrase.as_bytes())?;
        if std::env::var_os(&config.vault.bootstrap_key_env).is_some() {
            println!(
                "Created keyfile: {} (generation 1 from ${})",
                keyfile_path.display(),
                config.vault.bootstrap_key_env
            );
        } else {
            println!("Created keyfile: {} (generation 1)", keyfile_path.display());
        }
        keys
    };

    let db_path = Path::new(&config.vault.db_path);
    let _store = CredentialStore::open(db_path, keys)?;
    println!("Initialized database: {}", db_path.display());

    println!("\ncredvault initialized. Next steps:");
    println!("  1. Run `credvault put <device> <username>` to store a credential");
    println!("  2. Run `credvault rotate` to rotate the encryption key");

    Ok(())
}
