use anyhow::Result;
use std::path::Path;

use credvault_core::selector::CredentialSelector;

use super::vault::Vault;

pub fn run(base_dir: &Path, cli_passphrase: &Option<String>, scope: &str) -> Result<()> {
    let vault = Vault::open(base_dir, cli_passphrase)?;
    let ranked = CredentialSelector::new(vault.store.clone()).ranked(scope)?;

    if ranked.is_empty() {
        println!("No candidate credentials for {scope}.");
        return Ok(());
    }

    println!("{:<4} {:<38} {:>7} {:>4} {}", "RANK", "ID", "RATE", "PRIO", "LAST USED");
    for (i, c) in ranked.iter().enumerate() {
        println!(
            "{:<4} {:<38} {:>6.1}% {:>4} {}",
            i + 1,
            c.id,
            c.success_rate() * 100.0,
            c.priority,
            c.last_used_at.as_deref().unwrap_or("never"),
        );
    }
    Ok(())
}
