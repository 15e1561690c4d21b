use anyhow::Result;
use std::path::Path;

use credvault_core::types::Generation;

use super::vault::Vault;

pub async fn list(base_dir: &Path, cli_passphrase: &Option<String>) -> Result<()> {
    let vault = Vault::open(base_dir, cli_passphrase)?;
    let keys = vault.store.keys().list().await?;
    let usage = vault.store.generation_usage()?;

    println!(
        "{:<5} {:<10} {:<18} {:>8} {}",
        "GEN", "STATUS", "FINGERPRINT", "RECORDS", "CREATED"
    );
    println!("{}", "-".repeat(80));
    for k in &keys {
        let records = usage
            .iter()
            .find(|(g, _)| *g == k.generation)
            .map_or(0, |(_, n)| *n);
        println!(
            "{:<5} {:<10} {:<18} {:>8} {}",
            k.generation, k.status, k.fingerprint, records, k.created_at
        );
    }

    // Records whose generation is no longer in the key store.
    for (generation, count) in &usage {
        if !keys.iter().any(|k| k.generation == *generation) {
            println!(
                "warning: {count} record(s) use generation {generation}, which is not in the key store (see `credvault restore-key`)"
            );
        }
    }
    Ok(())
}

pub async fn restore(
    base_dir: &Path,
    cli_passphrase: &Option<String>,
    generation: Generation,
) -> Result<()> {
    let vault = Vault::open(base_dir, cli_passphrase)?;
    let info = vault.store.keys().restore(generation).await?;
    println!(
        "Generation {} available again (fingerprint {})",
        info.generation, info.fingerprint
    );
    Ok(())
}

pub async fn prune(
    base_dir: &Path,
    cli_passphrase: &Option<String>,
    generation: Generation,
) -> Result<()> {
    let vault = Vault::open(base_dir, cli_passphrase)?;
    vault
        .store
        .keys()
        .prune(generation, vault.store.as_ref())
        .await?;
    println!("Generation {generation} pruned");
    Ok(())
}
