use anyhow::Result;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::future::Future;
use std::path::Path;

use credvault_core::VaultError;
use credvault_core::types::{Generation, RotationRun, RotationStatus};
use credvault_rotation::RotationManager;

use super::vault::Vault;

pub async fn rotate(base_dir: &Path, cli_passphrase: &Option<String>, json: bool) -> Result<()> {
    let vault = Vault::open(base_dir, cli_passphrase)?;
    let manager = vault.manager();
    manager.recover_interrupted()?;
    let run = drive(&manager, json, manager.rotate()).await?;
    report(&run, json)
}

pub async fn resume(base_dir: &Path, cli_passphrase: &Option<String>, json: bool) -> Result<()> {
    let vault = Vault::open(base_dir, cli_passphrase)?;
    let manager = vault.manager();
    let recovered = manager.recover_interrupted()?;
    if !recovered.is_empty() && !json {
        println!("Marked {} interrupted run(s) as failed", recovered.len());
    }
    let run = drive(&manager, json, manager.resume()).await?;
    report(&run, json)
}

/// Await a rotation while mirroring its progress onto a bar.
async fn drive(
    manager: &RotationManager,
    json: bool,
    rotation: impl Future<Output = credvault_core::Result<RotationRun>>,
) -> Result<RotationRun> {
    let mut progress = manager.progress();
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("=>-"),
    );
    if json {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }
    pb.set_message("re-encrypting");

    tokio::pin!(rotation);
    let result = loop {
        tokio::select! {
            result = &mut rotation => break result,
            changed = progress.changed() => {
                if changed.is_err() {
                    break (&mut rotation).await;
                }
                let p = *progress.borrow_and_update();
                pb.set_length(p.total);
                pb.set_position(p.processed);
            }
        }
    };
    pb.finish_and_clear();

    match result {
        Err(VaultError::ConcurrentRotation) => {
            anyhow::bail!("a rotation is already in progress, try again later")
        }
        other => Ok(other?),
    }
}

/// Print the run summary. Anything short of a clean completion is an error
/// so the exit status reflects it.
fn report(run: &RotationRun, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
    } else {
        print_run(run);
    }

    match run.status {
        RotationStatus::Completed => Ok(()),
        RotationStatus::CompletedWithErrors => anyhow::bail!(
            "rotation completed with {} failed record(s)",
            run.failed_record_ids.len()
        ),
        status => anyhow::bail!(
            "rotation {status}: {}",
            run.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

fn generations(list: &[Generation]) -> String {
    if list.is_empty() {
        "-".to_string()
    } else {
        list.iter().map(|g| g.to_string()).collect::<Vec<_>>().join(", ")
    }
}

pub fn print_run(run: &RotationRun) {
    println!("Rotation run:");
    println!("  ID:             {}", run.run_id);
    println!("  Status:         {}", run.status);
    println!("  Phase:          {}", run.phase);
    println!("  From:           {}", generations(&run.from_generations));
    println!(
        "  To:             {}",
        run.to_generation.map_or("-".to_string(), |g| g.to_string())
    );
    println!(
        "  Records:        {}/{}",
        run.processed_records, run.total_records
    );
    println!("  Backed up:      {}", generations(&run.backed_up));
    println!("  Pruned:         {}", generations(&run.pruned));
    println!("  Retained:       {}", generations(&run.retained));
    println!("  Started:        {}", run.started_at);
    if let Some(ref finished) = run.finished_at {
        println!("  Finished:       {finished}");
    }
    if let Some(ref error) = run.error {
        println!("  Error:          {error}");
    }
    if !run.failed_record_ids.is_empty() {
        println!("\n  Failed records ({}):", run.failed_record_ids.len());
        for id in &run.failed_record_ids {
            println!("    - {id}");
        }
    }
}
