//! Periodic rotation.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use credvault_core::error::{Result, VaultError};
use credvault_core::types::RotationRun;

use crate::manager::RotationManager;

/// When the next rotation is due, given the last successful run.
/// `None` means no run ever succeeded: due now.
pub fn next_due(last_success: Option<&RotationRun>, interval: Duration) -> Option<DateTime<Utc>> {
    let finished = last_success?.finished_at.as_deref()?;
    let finished = DateTime::parse_from_rfc3339(finished).ok()?.with_timezone(&Utc);
    let interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX);
    Some(finished.checked_add_signed(interval).unwrap_or(DateTime::<Utc>::MAX_UTC))
}

pub fn is_due(last_success: Option<&RotationRun>, interval: Duration, now: DateTime<Utc>) -> bool {
    next_due(last_success, interval).is_none_or(|due| due <= now)
}

/// Rotate whenever the last successful run is older than `interval`,
/// checking every `tick`, until `shutdown` flips to true or its sender is
/// dropped.
///
/// A tick that finds a rotation already running is skipped. Any other error
/// ends the loop.
pub async fn run_every(
    manager: &RotationManager,
    interval: Duration,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(interval_secs = interval.as_secs(), "rotation scheduler started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let last = manager.store().last_successful_run()?;
                if !is_due(last.as_ref(), interval, Utc::now()) {
                    debug!("rotation not due");
                    continue;
                }
                match manager.rotate().await {
                    Ok(run) => info!(
                        run = %run.run_id,
                        status = %run.status,
                        failed = run.failed_record_ids.len(),
                        "scheduled rotation finished"
                    ),
                    Err(VaultError::ConcurrentRotation) => {
                        info!("rotation already in progress, skipping tick");
                    }
                    Err(e) => {
                        error!(error = %e, "scheduled rotation could not start");
                        return Err(e);
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("rotation scheduler stopping");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credvault_core::types::RotationStatus;

    fn finished_at(ts: &str) -> RotationRun {
        let mut run = RotationRun::start();
        run.finish(RotationStatus::Completed);
        run.finished_at = Some(ts.to_string());
        run
    }

    fn at(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn never_rotated_is_due() {
        assert!(next_due(None, Duration::from_secs(60)).is_none());
        assert!(is_due(None, Duration::from_secs(60), Utc::now()));
    }

    #[test]
    fn due_after_interval() {
        let run = finished_at("2026-03-01T00:00:00.000000Z");
        let week = Duration::from_secs(7 * 86_400);
        assert_eq!(
            next_due(Some(&run), week),
            Some(at("2026-03-08T00:00:00Z"))
        );
        assert!(!is_due(Some(&run), week, at("2026-03-07T23:59:59Z")));
        assert!(is_due(Some(&run), week, at("2026-03-08T00:00:00Z")));
    }
}
