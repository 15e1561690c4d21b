use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;

use credvault_rotation::schedule::{next_due, run_every};

use super::vault::Vault;

pub async fn run(base_dir: &Path, cli_passphrase: &Option<String>, check_secs: u64) -> Result<()> {
    let vault = Vault::open(base_dir, cli_passphrase)?;
    let manager = vault.manager();
    manager.recover_interrupted()?;

    let interval = vault.config.rotation.interval();
    let last = vault.store.last_successful_run()?;
    match next_due(last.as_ref(), interval) {
        Some(due) => println!("Next rotation due at {}", due.to_rfc3339()),
        None => println!("No successful rotation yet, rotating now"),
    }
    println!("Press Ctrl-C to stop.");

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
    });

    run_every(&manager, interval, Duration::from_secs(check_secs.max(1)), rx).await?;
    Ok(())
}
