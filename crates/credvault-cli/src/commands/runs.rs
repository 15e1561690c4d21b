use anyhow::Result;
use std::path::Path;

use super::rotate::print_run;
use super::vault::Vault;

pub fn list(base_dir: &Path, cli_passphrase: &Option<String>, limit: u32) -> Result<()> {
    let vault = Vault::open(base_dir, cli_passphrase)?;
    let runs = vault.store.list_runs(limit)?;

    if runs.is_empty() {
        println!("No rotation runs found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<22} {:<5} {:>10} {:>6} {}",
        "ID", "STATUS", "TO", "RECORDS", "FAILED", "STARTED"
    );
    println!("{}", "-".repeat(110));

    for r in &runs {
        println!(
            "{:<38} {:<22} {:<5} {:>10} {:>6} {}",
            r.run_id,
            r.status,
            r.to_generation.map_or("-".to_string(), |g| g.to_string()),
            format!("{}/{}", r.processed_records, r.total_records),
            r.failed_record_ids.len(),
            r.started_at,
        );
    }

    Ok(())
}

pub fn show(base_dir: &Path, cli_passphrase: &Option<String>, run_id: &str) -> Result<()> {
    let vault = Vault::open(base_dir, cli_passphrase)?;
    let run = vault.store.get_run(run_id)?;
    print_run(&run);

    let logs = vault.store.run_logs(run_id)?;
    if !logs.is_empty() {
        println!("\n  Log:");
        for (level, message, created_at) in &logs {
            println!("    {created_at} {level:<5} {message}");
        }
    }
    Ok(())
}
