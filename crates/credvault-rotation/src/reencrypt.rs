//! Bulk migration of credential secrets onto the Active key.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use credvault_core::crypto::{decrypt_secret, encrypt_secret};
use credvault_core::error::{Result, VaultError};
use credvault_core::store::CredentialStore;
use credvault_core::types::{CredentialRecord, Generation, KeyRecord, RotationRun};

/// `(processed_records, total_records)` for the pass in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub processed: u64,
    pub total: u64,
}

/// Outcome of one re-encryption pass.
#[derive(Debug, Default)]
pub struct PassReport {
    pub migrated: u64,
    /// Rows rewritten by someone else mid-pass; left as they are.
    pub skipped: u64,
    /// Failing record ids per source generation.
    pub failed: BTreeMap<Generation, BTreeSet<String>>,
}

impl PassReport {
    pub fn failed_generations(&self) -> BTreeSet<Generation> {
        self.failed.keys().copied().collect()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Walks every old generation in id order and reseals each record under the
/// target key, one compare-and-swap update per record.
pub struct ReEncryptionEngine {
    store: Arc<CredentialStore>,
    batch_size: usize,
    progress: watch::Sender<Progress>,
}

impl ReEncryptionEngine {
    pub fn new(store: Arc<CredentialStore>, batch_size: usize) -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            store,
            batch_size: batch_size.max(1),
            progress,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    /// Migrate every record not already under `target`.
    ///
    /// Per-record decryption failures are collected into `run` and the pass
    /// continues. Store or key-store errors abort the pass. `run` is
    /// checkpointed after every batch.
    pub async fn run(&self, target: &KeyRecord, run: &mut RotationRun) -> Result<PassReport> {
        let sources: Vec<(Generation, u64)> = self
            .store
            .generation_usage()?
            .into_iter()
            .filter(|(generation, _)| *generation != target.generation)
            .collect();
        let total: u64 = sources.iter().map(|(_, count)| count).sum();

        run.total_records = total;
        run.processed_records = 0;
        self.store.update_run(run)?;
        self.progress.send_replace(Progress { processed: 0, total });
        info!(
            run = %run.run_id,
            target = %target.generation,
            total,
            sources = sources.len(),
            "re-encryption pass started"
        );

        let mut report = PassReport::default();
        for (generation, count) in sources {
            let key = match self.store.keys().get(generation).await {
                Ok(key) => Some(key),
                Err(VaultError::UnknownGeneration(_)) => {
                    warn!(generation = %generation, count, "no key material for generation, its records cannot be migrated");
                    None
                }
                Err(e) => return Err(e),
            };
            self.migrate_generation(generation, key.as_ref(), target, run, &mut report)?;
        }

        info!(
            run = %run.run_id,
            migrated = report.migrated,
            skipped = report.skipped,
            failed = run.failed_record_ids.len(),
            "re-encryption pass finished"
        );
        Ok(report)
    }

    fn migrate_generation(
        &self,
        generation: Generation,
        key: Option<&KeyRecord>,
        target: &KeyRecord,
        run: &mut RotationRun,
        report: &mut PassReport,
    ) -> Result<()> {
        let mut scan = self.store.list_by_generation(generation, self.batch_size);
        while let Some(batch) = scan.next_batch()? {
            for record in &batch {
                let outcome = match key {
                    Some(key) => self.migrate_record(record, key, target),
                    None => Err(VaultError::UnknownGeneration(generation)),
                };
                match outcome {
                    Ok(true) => report.migrated += 1,
                    Ok(false) => {
                        debug!(credential = %record.id, "record changed during pass, skipped");
                        report.skipped += 1;
                    }
                    Err(e) if e.is_record_local() => {
                        warn!(credential = %record.id, generation = %generation, error = %e, "record could not be re-encrypted");
                        self.store.log_run(
                            &run.run_id,
                            "WARN",
                            &format!("credential {} (generation {generation}): {e}", record.id),
                        )?;
                        report
                            .failed
                            .entry(generation)
                            .or_default()
                            .insert(record.id.clone());
                        run.failed_record_ids.insert(record.id.clone());
                    }
                    Err(e) => return Err(e),
                }
                run.processed_records += 1;
            }

            self.store.update_run(run)?;
            self.progress.send_replace(Progress {
                processed: run.processed_records,
                total: run.total_records,
            });
            debug!(
                generation = %generation,
                cursor = scan.cursor().unwrap_or(""),
                processed = run.processed_records,
                "batch checkpointed"
            );
        }
        Ok(())
    }

    /// Returns false when the row no longer holds the ciphertext we read.
    fn migrate_record(
        &self,
        record: &CredentialRecord,
        key: &KeyRecord,
        target: &KeyRecord,
    ) -> Result<bool> {
        let secret = decrypt_secret(&record.id, &record.secret_ciphertext, key)?;
        let sealed = encrypt_secret(&record.id, &secret, target)?;
        self.store.swap_ciphertext(
            &record.id,
            record.key_generation,
            &record.secret_ciphertext,
            &sealed,
            target.generation,
        )
    }
}
