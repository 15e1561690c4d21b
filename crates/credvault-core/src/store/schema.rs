use rusqlite::Connection;

use crate::error::Result;

/// Run all migrations on the database.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA foreign_keys=ON;

        CREATE TABLE IF NOT EXISTS credentials (
            id                  TEXT PRIMARY KEY,
            device_scope        TEXT NOT NULL,
            username            TEXT NOT NULL,
            secret_ciphertext   BLOB NOT NULL,
            key_generation      INTEGER NOT NULL,
            success_count       INTEGER NOT NULL DEFAULT 0,
            failure_count       INTEGER NOT NULL DEFAULT 0,
            last_used_at        TEXT,
            priority            INTEGER NOT NULL DEFAULT 0,
            is_system_protected INTEGER NOT NULL DEFAULT 0,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_credentials_generation
            ON credentials(key_generation, id);
        CREATE INDEX IF NOT EXISTS idx_credentials_scope
            ON credentials(device_scope);

        CREATE TABLE IF NOT EXISTS rotation_runs (
            run_id              TEXT PRIMARY KEY,
            started_at          TEXT NOT NULL,
            finished_at         TEXT,
            from_generations    TEXT NOT NULL DEFAULT '[]',
            to_generation       INTEGER,
            total_records       INTEGER NOT NULL DEFAULT 0,
            processed_records   INTEGER NOT NULL DEFAULT 0,
            failed_record_ids   TEXT NOT NULL DEFAULT '[]',
            status              TEXT NOT NULL DEFAULT 'running',
            phase               TEXT NOT NULL DEFAULT 'idle',
            backed_up           TEXT NOT NULL DEFAULT '[]',
            pruned              TEXT NOT NULL DEFAULT '[]',
            retained            TEXT NOT NULL DEFAULT '[]',
            error               TEXT
        );

        CREATE TABLE IF NOT EXISTS rotation_logs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id      TEXT REFERENCES rotation_runs(run_id),
            level       TEXT NOT NULL,
            message     TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        ",
    )?;

    Ok(())
}
