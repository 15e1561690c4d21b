use anyhow::Result;
use std::path::Path;

use credvault_core::config::VaultConfig;

pub fn run(base_dir: &Path) -> Result<()> {
    let config_path = VaultConfig::default_path(base_dir);
    let config = VaultConfig::load(&config_path)?;

    println!("Config: {}", config_path.display());
    println!();
    println!("  DB path:        {}", config.vault.db_path);
    println!("  Key provider:   {}", config.vault.key_provider);
    println!("  Keyfile:        {}", config.vault.keyfile_path);
    println!("  Backup dir:     {}", config.vault.backup_dir);
    println!("  Bootstrap env:  {}", config.vault.bootstrap_key_env);
    println!();
    println!("  Rotation:");
    println!("    interval:        {} day(s)", config.rotation.interval_days);
    println!("    batch size:      {}", config.rotation.batch_size);
    println!(
        "    backup retries:  {} attempt(s), {} ms initial backoff",
        config.rotation.backup_max_attempts, config.rotation.backup_backoff_ms
    );
    println!("    max key history: {}", config.rotation.max_key_history);

    Ok(())
}
