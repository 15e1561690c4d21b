use anyhow::Result;
use std::path::Path;

use super::vault::Vault;

pub fn run(base_dir: &Path, cli_passphrase: &Option<String>, scope: Option<&str>) -> Result<()> {
    let vault = Vault::open(base_dir, cli_passphrase)?;
    let records = vault.store.list(scope)?;

    if records.is_empty() {
        println!("No credentials found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<16} {:<20} {:>4} {:>6} {:>6} {:>4} {}",
        "ID", "SCOPE", "USERNAME", "GEN", "OK", "FAIL", "PRIO", "LAST USED"
    );
    println!("{}", "-".repeat(120));

    for r in &records {
        println!(
            "{:<38} {:<16} {:<20} {:>4} {:>6} {:>6} {:>4} {}{}",
            r.id,
            r.device_scope,
            r.username,
            r.key_generation,
            r.success_count,
            r.failure_count,
            r.priority,
            r.last_used_at.as_deref().unwrap_or("never"),
            if r.is_system_protected { "  [protected]" } else { "" },
        );
    }

    Ok(())
}
