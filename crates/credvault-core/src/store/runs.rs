use rusqlite::{OptionalExtension, Row, params};
use std::collections::BTreeSet;

use crate::error::{Result, VaultError};
use crate::types::{Generation, RotationRun, RotationStatus, now_timestamp};

use super::queries::CredentialStore;

const RUN_COLUMNS: &str = "run_id, started_at, finished_at, from_generations, to_generation, total_records, processed_records, failed_record_ids, status, phase, backed_up, pruned, retained, error";

/// Raw row; JSON columns are decoded outside the rusqlite closure.
struct RunRow {
    run_id: String,
    started_at: String,
    finished_at: Option<String>,
    from_generations: String,
    to_generation: Option<Generation>,
    total_records: u64,
    processed_records: u64,
    failed_record_ids: String,
    status: String,
    phase: String,
    backed_up: String,
    pruned: String,
    retained: String,
    error: Option<String>,
}

fn read_run_row(row: &Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        run_id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        from_generations: row.get(3)?,
        to_generation: row.get(4)?,
        total_records: row.get(5)?,
        processed_records: row.get(6)?,
        failed_record_ids: row.get(7)?,
        status: row.get(8)?,
        phase: row.get(9)?,
        backed_up: row.get(10)?,
        pruned: row.get(11)?,
        retained: row.get(12)?,
        error: row.get(13)?,
    })
}

impl RunRow {
    fn decode(self) -> Result<RotationRun> {
        Ok(RotationRun {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: self.finished_at,
            from_generations: serde_json::from_str(&self.from_generations)?,
            to_generation: self.to_generation,
            total_records: self.total_records,
            processed_records: self.processed_records,
            failed_record_ids: serde_json::from_str::<BTreeSet<String>>(&self.failed_record_ids)?,
            status: self.status.parse()?,
            phase: self.phase.parse()?,
            backed_up: serde_json::from_str(&self.backed_up)?,
            pruned: serde_json::from_str(&self.pruned)?,
            retained: serde_json::from_str(&self.retained)?,
            error: self.error,
        })
    }
}

impl CredentialStore {
    // ── Rotation runs ──────────────────────────────────────────

    pub fn insert_run(&self, run: &RotationRun) -> Result<()> {
        self.conn()?.execute(
            &format!("INSERT INTO rotation_runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"),
            params![
                run.run_id,
                run.started_at,
                run.finished_at,
                serde_json::to_string(&run.from_generations)?,
                run.to_generation,
                run.total_records,
                run.processed_records,
                serde_json::to_string(&run.failed_record_ids)?,
                run.status.to_string(),
                run.phase.to_string(),
                serde_json::to_string(&run.backed_up)?,
                serde_json::to_string(&run.pruned)?,
                serde_json::to_string(&run.retained)?,
                run.error,
            ],
        )?;
        Ok(())
    }

    /// Persist the full current state of a run (progress checkpoints included).
    pub fn update_run(&self, run: &RotationRun) -> Result<()> {
        let updated = self.conn()?.execute(
            "UPDATE rotation_runs SET finished_at=?2, from_generations=?3, to_generation=?4, total_records=?5,
                processed_records=?6, failed_record_ids=?7, status=?8, phase=?9, backed_up=?10, pruned=?11,
                retained=?12, error=?13
             WHERE run_id=?1",
            params![
                run.run_id,
                run.finished_at,
                serde_json::to_string(&run.from_generations)?,
                run.to_generation,
                run.total_records,
                run.processed_records,
                serde_json::to_string(&run.failed_record_ids)?,
                run.status.to_string(),
                run.phase.to_string(),
                serde_json::to_string(&run.backed_up)?,
                serde_json::to_string(&run.pruned)?,
                serde_json::to_string(&run.retained)?,
                run.error,
            ],
        )?;
        if updated == 0 {
            return Err(VaultError::RunNotFound(run.run_id.clone()));
        }
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<RotationRun> {
        let row = self
            .conn()?
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM rotation_runs WHERE run_id=?1"),
                params![run_id],
                read_run_row,
            )
            .optional()?
            .ok_or_else(|| VaultError::RunNotFound(run_id.to_string()))?;
        row.decode()
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: u32) -> Result<Vec<RotationRun>> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM rotation_runs ORDER BY started_at DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], read_run_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        rows.into_iter().map(RunRow::decode).collect()
    }

    /// Latest run that activated and migrated a key (clean or with errors).
    pub fn last_successful_run(&self) -> Result<Option<RotationRun>> {
        let row = self
            .conn()?
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM rotation_runs
                     WHERE status IN ('completed', 'completed_with_errors')
                     ORDER BY finished_at DESC LIMIT 1"
                ),
                [],
                read_run_row,
            )
            .optional()?;
        row.map(RunRow::decode).transpose()
    }

    /// Mark runs left `running` by a dead process as failed. Returns their ids.
    pub fn fail_interrupted_runs(&self) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare("SELECT run_id FROM rotation_runs WHERE status = ?1")?;
            let rows = stmt.query_map(params![RotationStatus::Running.to_string()], |row| {
                row.get::<_, String>(0)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.execute(
            "UPDATE rotation_runs SET status = ?1, phase = 'failed', finished_at = ?2,
                error = COALESCE(error, 'interrupted before completion')
             WHERE status = ?3",
            params![
                RotationStatus::Failed.to_string(),
                now_timestamp(),
                RotationStatus::Running.to_string()
            ],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    // ── Rotation logs ──────────────────────────────────────────

    pub fn log_run(&self, run_id: &str, level: &str, message: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO rotation_logs (run_id, level, message) VALUES (?1, ?2, ?3)",
            params![run_id, level, message],
        )?;
        Ok(())
    }

    /// (level, message, created_at) in insertion order.
    pub fn run_logs(&self, run_id: &str) -> Result<Vec<(String, String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT level, message, created_at FROM rotation_logs WHERE run_id=?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryKeyStore;
    use crate::types::RotationPhase;
    use std::sync::Arc;

    fn store() -> CredentialStore {
        CredentialStore::open_in_memory(Arc::new(MemoryKeyStore::bootstrap())).unwrap()
    }

    #[test]
    fn run_roundtrip() {
        let store = store();
        let mut run = RotationRun::start();
        run.to_generation = Some(Generation(2));
        run.from_generations = vec![Generation(1)];
        store.insert_run(&run).unwrap();

        run.total_records = 3;
        run.processed_records = 3;
        run.failed_record_ids.insert("cred-x".to_string());
        run.phase = RotationPhase::Done;
        run.retained = vec![Generation(1)];
        run.finish(RotationStatus::CompletedWithErrors);
        store.update_run(&run).unwrap();

        let loaded = store.get_run(&run.run_id).unwrap();
        assert_eq!(loaded, run);
        assert_eq!(
            store.last_successful_run().unwrap().unwrap().run_id,
            run.run_id
        );
    }

    #[test]
    fn unknown_run() {
        let store = store();
        assert!(matches!(
            store.get_run("nope"),
            Err(VaultError::RunNotFound(_))
        ));
        assert!(matches!(
            store.update_run(&RotationRun::start()),
            Err(VaultError::RunNotFound(_))
        ));
    }

    #[test]
    fn interrupted_runs_are_failed() {
        let store = store();
        let running = RotationRun::start();
        store.insert_run(&running).unwrap();
        let mut done = RotationRun::start();
        done.finish(RotationStatus::Completed);
        store.insert_run(&done).unwrap();

        let failed = store.fail_interrupted_runs().unwrap();
        assert_eq!(failed, vec![running.run_id.clone()]);

        let reloaded = store.get_run(&running.run_id).unwrap();
        assert_eq!(reloaded.status, RotationStatus::Failed);
        assert_eq!(reloaded.phase, RotationPhase::Failed);
        assert!(reloaded.error.is_some());
        assert_eq!(
            store.get_run(&done.run_id).unwrap().status,
            RotationStatus::Completed
        );
    }

    #[test]
    fn list_runs_newest_first_and_logs() {
        let store = store();
        let first = RotationRun::start();
        store.insert_run(&first).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = RotationRun::start();
        store.insert_run(&second).unwrap();

        let runs = store.list_runs(10).unwrap();
        assert_eq!(runs[0].run_id, second.run_id);
        assert_eq!(runs[1].run_id, first.run_id);

        store.log_run(&first.run_id, "INFO", "started").unwrap();
        store.log_run(&first.run_id, "WARN", "cred-1 failed").unwrap();
        let logs = store.run_logs(&first.run_id).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].0, "WARN");
    }
}
