//! Drives a rotation through its phases:
//!
//! ```text
//! Idle → GeneratingKey → Activating → ReEncrypting → BackingUpOldKey → Pruning → Done
//!                                          any unhandled error ───────────────→ Failed
//! ```
//!
//! Rotation only moves forward. Once a key is Active it stays Active; a run
//! that stops half way is finished by `resume`, which re-applies the same
//! steps against the current Active key.

use rand::RngCore;
use rand::rngs::OsRng;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use credvault_core::config::RotationSettings;
use credvault_core::error::{Result, VaultError};
use credvault_core::keystore::{KeyMaterialStore, RotationLease};
use credvault_core::store::CredentialStore;
use credvault_core::types::{
    BackupHandle, Generation, KEY_LEN, KeyBytes, KeyRecord, KeyStatus, RotationPhase,
    RotationRun, RotationStatus,
};

use crate::reencrypt::{PassReport, Progress, ReEncryptionEngine};

/// Bounds applied to every run.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    pub batch_size: usize,
    pub backup_max_attempts: u32,
    /// First retry delay; doubled after each failed attempt.
    pub backup_backoff: Duration,
    pub max_key_history: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self::from(&RotationSettings::default())
    }
}

impl From<&RotationSettings> for RotationPolicy {
    fn from(settings: &RotationSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            backup_max_attempts: settings.backup_max_attempts.max(1),
            backup_backoff: settings.backup_backoff(),
            max_key_history: settings.max_key_history,
        }
    }
}

pub struct RotationManager {
    store: Arc<CredentialStore>,
    keys: Arc<dyn KeyMaterialStore>,
    engine: ReEncryptionEngine,
    policy: RotationPolicy,
}

fn fresh_material() -> KeyBytes {
    let mut material = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(material.as_mut());
    material
}

impl RotationManager {
    pub fn new(store: Arc<CredentialStore>, policy: RotationPolicy) -> Self {
        Self {
            keys: store.keys().clone(),
            engine: ReEncryptionEngine::new(store.clone(), policy.batch_size),
            store,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Progress of the re-encryption pass, for display.
    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.engine.subscribe()
    }

    /// Mark runs a crashed process left `Running` as `Failed`.
    pub fn recover_interrupted(&self) -> Result<Vec<String>> {
        let ids = self.store.fail_interrupted_runs()?;
        for id in &ids {
            warn!(run = %id, "rotation run was interrupted, marked failed");
            self.store
                .log_run(id, "ERROR", "run interrupted before completion, marked failed")?;
        }
        Ok(ids)
    }

    /// Generate a new key, activate it and migrate everything onto it.
    ///
    /// `ConcurrentRotation` is returned as an error and leaves no run behind.
    /// Every other outcome, including `Failed` and `RolledBack`, is returned
    /// as a persisted run summary.
    pub async fn rotate(&self) -> Result<RotationRun> {
        if self.keys.rotation_in_progress() {
            return Err(VaultError::ConcurrentRotation);
        }
        let previous = self.keys.get_active().await?;

        let mut run = RotationRun::start();
        run.phase = RotationPhase::GeneratingKey;
        let material = fresh_material();

        run.phase = RotationPhase::Activating;
        let (target, lease) = match self.keys.create_and_activate(material).await {
            Ok(activated) => activated,
            Err(VaultError::ConcurrentRotation) => return Err(VaultError::ConcurrentRotation),
            Err(e) => {
                run.to_generation = None;
                run.from_generations = vec![previous.generation];
                run.phase = RotationPhase::Failed;
                run.error = Some(e.to_string());
                run.finish(RotationStatus::RolledBack);
                self.store.insert_run(&run)?;
                self.audit(
                    &run.run_id,
                    "ERROR",
                    &format!("activation failed, generation {} stays active: {e}", previous.generation),
                );
                return Ok(run);
            }
        };

        run.to_generation = Some(target.generation);
        run.from_generations = self.old_generations(target.generation).await?;
        self.store.insert_run(&run)?;
        self.audit(
            &run.run_id,
            "INFO",
            &format!(
                "generation {} activated, replacing {}",
                target.generation, previous.generation
            ),
        );

        self.complete(run, target, lease).await
    }

    /// Finish migrating, backing up and pruning against the current Active
    /// key without generating a new one.
    pub async fn resume(&self) -> Result<RotationRun> {
        let lease = self.keys.acquire_rotation()?;
        let target = self.keys.get_active().await?;

        let mut run = RotationRun::start();
        run.to_generation = Some(target.generation);
        run.from_generations = self.old_generations(target.generation).await?;
        self.store.insert_run(&run)?;
        self.audit(
            &run.run_id,
            "INFO",
            &format!("resuming rotation onto generation {}", target.generation),
        );

        self.complete(run, target, lease).await
    }

    /// Every generation other than `target` that still holds records or
    /// still has material in the key store.
    async fn old_generations(&self, target: Generation) -> Result<Vec<Generation>> {
        let mut old: BTreeSet<Generation> = self
            .store
            .generation_usage()?
            .into_iter()
            .map(|(generation, _)| generation)
            .collect();
        old.extend(self.keys.list().await?.into_iter().map(|k| k.generation));
        old.remove(&target);
        Ok(old.into_iter().collect())
    }

    /// Phases from re-encryption to done. The lease is held until return.
    async fn complete(
        &self,
        mut run: RotationRun,
        target: KeyRecord,
        _lease: RotationLease,
    ) -> Result<RotationRun> {
        self.enter(&mut run, RotationPhase::ReEncrypting)?;
        let report = match self.engine.run(&target, &mut run).await {
            Ok(report) => report,
            Err(e) => return self.fail(run, e),
        };

        self.enter(&mut run, RotationPhase::BackingUpOldKey)?;
        let eligible = match self.back_up_old(&mut run, &report).await {
            Ok(eligible) => eligible,
            Err(e) => return self.fail(run, e),
        };

        self.enter(&mut run, RotationPhase::Pruning)?;
        if let Err(e) = self.prune_old(&mut run, &eligible).await {
            return self.fail(run, e);
        }
        if let Err(e) = self.check_history(&run).await {
            return self.fail(run, e);
        }

        run.phase = RotationPhase::Done;
        let status = if run.failed_record_ids.is_empty() {
            RotationStatus::Completed
        } else {
            RotationStatus::CompletedWithErrors
        };
        run.finish(status);
        self.store.update_run(&run)?;

        if status == RotationStatus::Completed {
            self.audit(&run.run_id, "INFO", "rotation completed");
        } else {
            let ids: Vec<&str> = run.failed_record_ids.iter().map(String::as_str).collect();
            self.audit(
                &run.run_id,
                "WARN",
                &format!(
                    "rotation completed with {} failed record(s): {}; retained generations {:?}",
                    ids.len(),
                    ids.join(", "),
                    run.retained
                ),
            );
        }
        Ok(run)
    }

    /// Back up every old generation with no failed records. All backups
    /// finish before anything is pruned. Returns the generations eligible
    /// for pruning.
    async fn back_up_old(&self, run: &mut RotationRun, report: &PassReport) -> Result<Vec<Generation>> {
        let failing = report.failed_generations();
        let mut eligible = Vec::new();

        for generation in run.from_generations.clone() {
            if failing.contains(&generation) {
                let ids = report
                    .failed
                    .get(&generation)
                    .map(|ids| ids.iter().cloned().collect::<Vec<_>>().join(", "))
                    .unwrap_or_default();
                self.audit(
                    &run.run_id,
                    "WARN",
                    &format!("generation {generation} retained, records failed to migrate: {ids}"),
                );
                run.retained.push(generation);
                continue;
            }

            match self.keys.get(generation).await {
                Ok(key) if key.status == KeyStatus::Active => continue,
                Ok(_) => {}
                // Material already gone (pruned by an earlier run).
                Err(VaultError::UnknownGeneration(_)) => continue,
                Err(e) => return Err(e),
            }

            let handle = self.backup_with_retry(&run.run_id, generation).await?;
            self.audit(
                &run.run_id,
                "INFO",
                &format!("generation {generation} backed up to {}", handle.location),
            );
            run.backed_up.push(generation);
            eligible.push(generation);
            self.store.update_run(run)?;
        }
        Ok(eligible)
    }

    async fn backup_with_retry(&self, run_id: &str, generation: Generation) -> Result<BackupHandle> {
        let mut attempt = 1;
        let mut delay = self.policy.backup_backoff;
        loop {
            match self.keys.backup(generation).await {
                Ok(handle) => return Ok(handle),
                Err(e @ VaultError::BackupIo { .. }) if attempt < self.policy.backup_max_attempts => {
                    self.audit(
                        run_id,
                        "WARN",
                        &format!(
                            "backup of generation {generation} failed (attempt {attempt}/{}): {e}",
                            self.policy.backup_max_attempts
                        ),
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn prune_old(&self, run: &mut RotationRun, eligible: &[Generation]) -> Result<()> {
        for &generation in eligible {
            match self.keys.prune(generation, self.store.as_ref()).await {
                Ok(()) => {
                    self.audit(&run.run_id, "INFO", &format!("generation {generation} pruned"));
                    run.pruned.push(generation);
                }
                // New rows appeared under the old key after the pass.
                Err(VaultError::GenerationInUse { references, .. }) => {
                    self.audit(
                        &run.run_id,
                        "WARN",
                        &format!(
                            "generation {generation} retained, still referenced by {references} record(s)"
                        ),
                    );
                    run.retained.push(generation);
                }
                Err(e) => return Err(e),
            }
            self.store.update_run(run)?;
        }
        Ok(())
    }

    async fn check_history(&self, run: &RotationRun) -> Result<()> {
        let kept = self.keys.list().await?;
        if kept.len() > self.policy.max_key_history {
            let generations: Vec<String> = kept.iter().map(|k| k.generation.to_string()).collect();
            self.audit(
                &run.run_id,
                "WARN",
                &format!(
                    "{} key generations retained (limit {}): {}",
                    kept.len(),
                    self.policy.max_key_history,
                    generations.join(", ")
                ),
            );
        }
        Ok(())
    }

    fn enter(&self, run: &mut RotationRun, phase: RotationPhase) -> Result<()> {
        run.phase = phase;
        self.store.update_run(run)?;
        info!(run = %run.run_id, phase = %phase, "rotation phase");
        Ok(())
    }

    fn fail(&self, mut run: RotationRun, cause: VaultError) -> Result<RotationRun> {
        error!(run = %run.run_id, phase = %run.phase, error = %cause, "rotation failed");
        let message = format!("failed during {}: {cause}", run.phase);
        run.phase = RotationPhase::Failed;
        run.error = Some(cause.to_string());
        run.finish(RotationStatus::Failed);
        self.store.update_run(&run)?;
        self.audit(&run.run_id, "ERROR", &message);
        Ok(run)
    }

    /// Mirror a message to tracing and the run's audit log.
    fn audit(&self, run_id: &str, level: &str, message: &str) {
        match level {
            "ERROR" => error!(run = %run_id, "{message}"),
            "WARN" => warn!(run = %run_id, "{message}"),
            _ => info!(run = %run_id, "{message}"),
        }
        if let Err(e) = self.store.log_run(run_id, level, message) {
            warn!(run = %run_id, error = %e, "could not write rotation log");
        }
    }
}
