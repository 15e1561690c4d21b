use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::crypto::{decrypt_secret, encrypt_secret};
use crate::error::{Result, VaultError};
use crate::keystore::{GenerationReferences, KeyMaterialStore};
use crate::types::{CredentialRecord, GLOBAL_SCOPE, Generation, NewCredential, now_timestamp};

use super::scan::GenerationScan;

pub(crate) const RECORD_COLUMNS: &str = "id, device_scope, username, secret_ciphertext, key_generation, success_count, failure_count, last_used_at, priority, is_system_protected, created_at";

/// Authoritative set of device credentials.
///
/// Secrets are sealed with the key generation recorded on each row. The
/// connection lock is held for one statement or one per-record transaction
/// at a time, never across an await.
pub struct CredentialStore {
    conn: Mutex<Connection>,
    keys: Arc<dyn KeyMaterialStore>,
}

impl CredentialStore {
    /// Open (or create) the credential database and run migrations.
    pub fn open(path: &Path, keys: Arc<dyn KeyMaterialStore>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        super::schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            keys,
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory(keys: Arc<dyn KeyMaterialStore>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        super::schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            keys,
        })
    }

    pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| VaultError::LockPoisoned("credential store"))
    }

    pub fn keys(&self) -> &Arc<dyn KeyMaterialStore> {
        &self.keys
    }

    // ── Secrets ────────────────────────────────────────────────

    /// Provision a credential, sealing the secret with the Active key.
    ///
    /// An existing id is overwritten (username, secret, scope, priority);
    /// its usage statistics are kept. Protection is only ever added here:
    /// a record once marked system-protected stays protected.
    pub async fn put(&self, new: NewCredential) -> Result<CredentialRecord> {
        let id = new
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());

        let generation = self
            .write_sealed(&id, &new.secret, |ciphertext, generation| {
                let now = now_timestamp();
                self.conn()?.execute(
                    "INSERT INTO credentials (id, device_scope, username, secret_ciphertext, key_generation, priority, is_system_protected, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                     ON CONFLICT(id) DO UPDATE SET
                        device_scope = excluded.device_scope,
                        username = excluded.username,
                        secret_ciphertext = excluded.secret_ciphertext,
                        key_generation = excluded.key_generation,
                        priority = excluded.priority,
                        is_system_protected = is_system_protected OR excluded.is_system_protected,
                        updated_at = excluded.updated_at",
                    params![
                        id,
                        new.device_scope,
                        new.username,
                        ciphertext,
                        generation,
                        new.priority,
                        new.is_system_protected,
                        now
                    ],
                )
                .map_err(VaultError::from)
            })
            .await?;
        debug!(credential = %id, generation = %generation, "credential stored");
        self.get(&id)
    }

    /// Decrypt a credential's secret with the key generation it was sealed under.
    pub async fn get_secret(&self, id: &str) -> Result<Zeroizing<String>> {
        let record = self.get(id)?;
        match self.open_record(&record).await {
            Ok(secret) => Ok(secret),
            // The row may have been re-encrypted (and its old generation
            // pruned) between the read and the key lookup. Read it again.
            Err(e @ (VaultError::UnknownGeneration(_) | VaultError::AuthenticationFailed)) => {
                let fresh = self.get(id)?;
                if fresh.key_generation == record.key_generation
                    && fresh.secret_ciphertext == record.secret_ciphertext
                {
                    return Err(e);
                }
                self.open_record(&fresh).await
            }
            Err(e) => Err(e),
        }
    }

    async fn open_record(&self, record: &CredentialRecord) -> Result<Zeroizing<String>> {
        let key = self.keys.get(record.key_generation).await?;
        decrypt_secret(&record.id, &record.secret_ciphertext, &key)
    }

    /// Replace a secret, sealing it with the Active key (not the row's old
    /// generation). Returns the generation the secret now uses.
    pub async fn update_secret(&self, id: &str, new_secret: &str) -> Result<Generation> {
        let generation = self
            .write_sealed(id, new_secret, |ciphertext, generation| {
                let updated = self.conn()?.execute(
                    "UPDATE credentials SET secret_ciphertext = ?2, key_generation = ?3, updated_at = ?4 WHERE id = ?1",
                    params![id, ciphertext, generation, now_timestamp()],
                )?;
                if updated == 0 {
                    return Err(VaultError::RecordNotFound(id.to_string()));
                }
                Ok(updated)
            })
            .await?;
        debug!(credential = %id, generation = %generation, "secret updated");
        Ok(generation)
    }

    /// Seal `secret` with the Active key and hand it to `write`.
    ///
    /// The key stays pinned until `write` returns, so no activation or prune
    /// (from this process or another one on the same keyfile) can land in
    /// between and leave the row on a retired or missing generation.
    async fn write_sealed<F>(&self, id: &str, secret: &str, write: F) -> Result<Generation>
    where
        F: FnOnce(&[u8], Generation) -> Result<usize>,
    {
        let pinned = self.keys.pin_active().await?;
        let key = pinned.key();
        let ciphertext = encrypt_secret(id, secret, key)?;
        write(&ciphertext, key.generation)?;
        Ok(key.generation)
    }

    /// Replace ciphertext and generation in one statement, only if the row
    /// still holds exactly `expected_ciphertext` under `expected`. Returns
    /// false when the row changed or vanished in the meantime.
    pub fn swap_ciphertext(
        &self,
        id: &str,
        expected: Generation,
        expected_ciphertext: &[u8],
        ciphertext: &[u8],
        to: Generation,
    ) -> Result<bool> {
        let updated = self.conn()?.execute(
            "UPDATE credentials SET secret_ciphertext = ?4, key_generation = ?5, updated_at = ?6
             WHERE id = ?1 AND key_generation = ?2 AND secret_ciphertext = ?3",
            params![id, expected, expected_ciphertext, ciphertext, to, now_timestamp()],
        )?;
        Ok(updated == 1)
    }

    // ── Statistics ─────────────────────────────────────────────

    /// Count one login attempt and stamp `last_used_at`.
    pub fn record_outcome(&self, id: &str, success: bool) -> Result<()> {
        let sql = if success {
            "UPDATE credentials SET success_count = success_count + 1, last_used_at = ?2 WHERE id = ?1"
        } else {
            "UPDATE credentials SET failure_count = failure_count + 1, last_used_at = ?2 WHERE id = ?1"
        };
        let updated = self.conn()?.execute(sql, params![id, now_timestamp()])?;
        if updated == 0 {
            return Err(VaultError::RecordNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Zero both counters. The only path that decreases them.
    pub fn reset_outcomes(&self, id: &str) -> Result<()> {
        let updated = self.conn()?.execute(
            "UPDATE credentials SET success_count = 0, failure_count = 0, updated_at = ?2 WHERE id = ?1",
            params![id, now_timestamp()],
        )?;
        if updated == 0 {
            return Err(VaultError::RecordNotFound(id.to_string()));
        }
        Ok(())
    }

    // ── Records ────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Result<CredentialRecord> {
        self.conn()?
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM credentials WHERE id = ?1"),
                params![id],
                row_to_record,
            )
            .optional()?
            .ok_or_else(|| VaultError::RecordNotFound(id.to_string()))
    }

    /// Delete a credential. Protected records need `force`.
    pub fn delete(&self, id: &str, force: bool) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let protected: Option<bool> = tx
            .query_row(
                "SELECT is_system_protected FROM credentials WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match protected {
            None => return Err(VaultError::RecordNotFound(id.to_string())),
            Some(true) if !force => return Err(VaultError::ProtectedRecord(id.to_string())),
            Some(true) => warn!(credential = %id, "deleting system-protected credential"),
            Some(false) => {}
        }
        tx.execute("DELETE FROM credentials WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    /// All credentials, optionally filtered to one exact scope, ordered by id.
    pub fn list(&self, scope: Option<&str>) -> Result<Vec<CredentialRecord>> {
        let conn = self.conn()?;
        let records = match scope {
            Some(scope) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM credentials WHERE device_scope = ?1 ORDER BY id"
                ))?;
                let rows = stmt.query_map(params![scope], row_to_record)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM credentials ORDER BY id"
                ))?;
                let rows = stmt.query_map([], row_to_record)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(records)
    }

    /// Credentials usable for a device: its own scope plus global ones.
    pub fn candidates(&self, device_scope: &str) -> Result<Vec<CredentialRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM credentials WHERE device_scope = ?1 OR device_scope = ?2 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![device_scope, GLOBAL_SCOPE], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count(&self) -> Result<u64> {
        Ok(self
            .conn()?
            .query_row("SELECT COUNT(*) FROM credentials", [], |row| row.get(0))?)
    }

    /// Records not yet sealed under `generation`.
    pub fn count_not_at(&self, generation: Generation) -> Result<u64> {
        Ok(self.conn()?.query_row(
            "SELECT COUNT(*) FROM credentials WHERE key_generation != ?1",
            params![generation],
            |row| row.get(0),
        )?)
    }

    /// (generation, record count) for every generation in use, ascending.
    pub fn generation_usage(&self) -> Result<Vec<(Generation, u64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key_generation, COUNT(*) FROM credentials GROUP BY key_generation ORDER BY key_generation",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Lazy, restartable walk over the records of one generation in id order.
    pub fn list_by_generation(&self, generation: Generation, batch_size: usize) -> GenerationScan<'_> {
        GenerationScan::new(self, generation, batch_size)
    }

    /// One page of `generation`'s records with id > `after`.
    pub(crate) fn fetch_page(
        &self,
        generation: Generation,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CredentialRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM credentials
             WHERE key_generation = ?1 AND id > ?2
             ORDER BY id LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![generation, after.unwrap_or(""), limit as i64],
            row_to_record,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl GenerationReferences for CredentialStore {
    fn references(&self, generation: Generation) -> Result<u64> {
        Ok(self.conn()?.query_row(
            "SELECT COUNT(*) FROM credentials WHERE key_generation = ?1",
            params![generation],
            |row| row.get(0),
        )?)
    }
}

pub(crate) fn row_to_record(row: &Row<'_>) -> rusqlite::Result<CredentialRecord> {
    Ok(CredentialRecord {
        id: row.get(0)?,
        device_scope: row.get(1)?,
        username: row.get(2)?,
        secret_ciphertext: row.get(3)?,
        key_generation: row.get(4)?,
        success_count: row.get(5)?,
        failure_count: row.get(6)?,
        last_used_at: row.get(7)?,
        priority: row.get(8)?,
        is_system_protected: row.get(9)?,
        created_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryKeyStore;

    fn store() -> (Arc<MemoryKeyStore>, CredentialStore) {
        let keys = Arc::new(MemoryKeyStore::bootstrap());
        let store = CredentialStore::open_in_memory(keys.clone()).unwrap();
        (keys, store)
    }

    #[tokio::test]
    async fn put_then_get_secret() {
        let (_keys, store) = store();
        let record = store
            .put(NewCredential::new("core-sw-01", "admin", "hunter2").with_priority(5))
            .await
            .unwrap();

        assert_eq!(record.key_generation, Generation(1));
        assert_eq!(record.priority, 5);
        assert_ne!(record.secret_ciphertext, b"hunter2");

        let secret = store.get_secret(&record.id).await.unwrap();
        assert_eq!(secret.as_str(), "hunter2");
    }

    #[tokio::test]
    async fn put_existing_id_keeps_statistics() {
        let (_keys, store) = store();
        store
            .put(NewCredential::new("r1", "admin", "old").with_id("cred-a"))
            .await
            .unwrap();
        store.record_outcome("cred-a", true).unwrap();

        let again = store
            .put(NewCredential::new("r1", "netops", "new").with_id("cred-a"))
            .await
            .unwrap();
        assert_eq!(again.username, "netops");
        assert_eq!(again.success_count, 1);
        assert_eq!(store.get_secret("cred-a").await.unwrap().as_str(), "new");
    }

    #[tokio::test]
    async fn update_secret_moves_to_active_generation() {
        let (keys, store) = store();
        let record = store
            .put(NewCredential::new("r1", "admin", "first"))
            .await
            .unwrap();

        let _lease = keys.activate_random().await;
        let generation = store.update_secret(&record.id, "second").await.unwrap();
        assert_eq!(generation, Generation(2));

        let reloaded = store.get(&record.id).unwrap();
        assert_eq!(reloaded.key_generation, Generation(2));
        assert_eq!(store.get_secret(&record.id).await.unwrap().as_str(), "second");
    }

    #[tokio::test]
    async fn update_secret_unknown_id() {
        let (_keys, store) = store();
        let result = store.update_secret("missing", "x").await;
        assert!(matches!(result, Err(VaultError::RecordNotFound(_))));
    }

    #[tokio::test]
    async fn outcomes_increment_and_reset() {
        let (_keys, store) = store();
        let record = store.put(NewCredential::new("r1", "a", "b")).await.unwrap();
        assert!(record.last_used_at.is_none());

        store.record_outcome(&record.id, true).unwrap();
        store.record_outcome(&record.id, true).unwrap();
        store.record_outcome(&record.id, false).unwrap();

        let after = store.get(&record.id).unwrap();
        assert_eq!((after.success_count, after.failure_count), (2, 1));
        assert!(after.last_used_at.is_some());

        store.reset_outcomes(&record.id).unwrap();
        let reset = store.get(&record.id).unwrap();
        assert_eq!((reset.success_count, reset.failure_count), (0, 0));

        assert!(matches!(
            store.record_outcome("missing", true),
            Err(VaultError::RecordNotFound(_))
        ));
    }

    #[tokio::test]
    async fn protected_delete_is_rejected() {
        let (_keys, store) = store();
        let record = store
            .put(NewCredential::new("r1", "svc", "pw").protected())
            .await
            .unwrap();

        let result = store.delete(&record.id, false);
        assert!(matches!(result, Err(VaultError::ProtectedRecord(_))));
        assert_eq!(store.get(&record.id).unwrap(), record);

        store.delete(&record.id, true).unwrap();
        assert!(matches!(
            store.get(&record.id),
            Err(VaultError::RecordNotFound(_))
        ));
    }

    #[tokio::test]
    async fn plain_put_keeps_protection() {
        let (_keys, store) = store();
        store
            .put(NewCredential::new("r1", "svc", "pw").with_id("sys").protected())
            .await
            .unwrap();

        let again = store
            .put(NewCredential::new("r1", "svc", "pw2").with_id("sys"))
            .await
            .unwrap();
        assert!(again.is_system_protected);
        assert!(matches!(
            store.delete("sys", false),
            Err(VaultError::ProtectedRecord(_))
        ));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_unprotected() {
        let (_keys, store) = store();
        let record = store.put(NewCredential::new("r1", "a", "b")).await.unwrap();
        store.delete(&record.id, false).unwrap();
        assert_eq!(store.count().unwrap(), 0);
        assert!(matches!(
            store.delete(&record.id, false),
            Err(VaultError::RecordNotFound(_))
        ));
    }

    #[tokio::test]
    async fn candidates_include_global_scope() {
        let (_keys, store) = store();
        store.put(NewCredential::new("r1", "a", "x")).await.unwrap();
        store.put(NewCredential::new("r2", "b", "x")).await.unwrap();
        store
            .put(NewCredential::new(GLOBAL_SCOPE, "fallback", "x"))
            .await
            .unwrap();

        let names: Vec<String> = store
            .candidates("r1")
            .unwrap()
            .into_iter()
            .map(|r| r.username)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"a".to_string()));
        assert!(names.contains(&"fallback".to_string()));
        assert!(store.candidates("unknown-device").unwrap().len() == 1);
    }

    #[tokio::test]
    async fn swap_is_compare_and_swap() {
        let (_keys, store) = store();
        let record = store.put(NewCredential::new("r1", "a", "x")).await.unwrap();

        let old = record.secret_ciphertext.clone();
        assert!(!store
            .swap_ciphertext(&record.id, Generation(9), &old, b"junk", Generation(2))
            .unwrap());
        assert!(!store
            .swap_ciphertext(&record.id, Generation(1), b"stale", b"junk", Generation(2))
            .unwrap());
        assert_eq!(store.get(&record.id).unwrap(), record);

        assert!(store
            .swap_ciphertext(&record.id, Generation(1), &old, b"new", Generation(2))
            .unwrap());
        assert_eq!(store.get(&record.id).unwrap().key_generation, Generation(2));
    }

    #[tokio::test]
    async fn generation_usage_and_references() {
        let (keys, store) = store();
        store.put(NewCredential::new("r1", "a", "x")).await.unwrap();
        store.put(NewCredential::new("r1", "b", "x")).await.unwrap();
        let _lease = keys.activate_random().await;
        store.put(NewCredential::new("r1", "c", "x")).await.unwrap();

        assert_eq!(
            store.generation_usage().unwrap(),
            vec![(Generation(1), 2), (Generation(2), 1)]
        );
        assert_eq!(store.references(Generation(1)).unwrap(), 2);
        assert_eq!(store.references(Generation(3)).unwrap(), 0);
        assert_eq!(store.count_not_at(Generation(2)).unwrap(), 2);
    }
}
