use anyhow::Result;
use std::path::Path;

use super::vault::Vault;

pub fn record(base_dir: &Path, cli_passphrase: &Option<String>, id: &str, success: bool) -> Result<()> {
    let vault = Vault::open(base_dir, cli_passphrase)?;
    vault.store.record_outcome(id, success)?;
    let r = vault.store.get(id)?;
    println!(
        "{id}: {} success / {} failure",
        r.success_count, r.failure_count
    );
    Ok(())
}

pub fn reset(base_dir: &Path, cli_passphrase: &Option<String>, id: &str) -> Result<()> {
    let vault = Vault::open(base_dir, cli_passphrase)?;
    vault.store.reset_outcomes(id)?;
    println!("Statistics of {id} reset");
    Ok(())
}
