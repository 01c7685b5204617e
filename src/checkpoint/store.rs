// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence.
//!
//! Stores the last applied change-log timestamp for each source and
//! destination pair in SQLite (see
//! [`SyncConfig::checkpoint_key`](crate::SyncConfig::checkpoint_key)) so a
//! restarted process resumes replication instead of running a full resync.
//!
//! # Debounced Writes
//!
//! - `set()` updates the in-memory cache immediately and marks the key dirty
//! - `flush_dirty()` persists all dirty checkpoints in a batch
//! - The synchronizer calls `flush_dirty()` periodically and whenever the
//!   tail goes idle
//! - `close()` flushes before closing the pool
//!
//! A crash between `set()` and `flush_dirty()` loses at most one flush
//! interval of progress. On restart those entries are re-applied, which is
//! harmless because every apply is idempotent.
//!
//! # Checkpoint Semantics
//!
//! The stored value is the timestamp of the **last applied** entry. Resuming
//! reads from it inclusively:
//!
//! ```text
//! read entry T → apply to destination → set(T)
//!                (crash here = re-read T, idempotent)
//! ```

use crate::error::{ReplicationError, Result};
use crate::oplog::Timestamp;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const IN_MEMORY_PATH: &str = ":memory:";

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::checkpoint_store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

fn timestamp_from_row(key: &str, time: i64, increment: i64) -> Option<Timestamp> {
    match (u32::try_from(time), u32::try_from(increment)) {
        (Ok(time), Ok(increment)) => Some(Timestamp::new(time, increment)),
        _ => {
            warn!(key, time, increment, "Ignoring out-of-range stored checkpoint");
            None
        }
    }
}

/// Persistent checkpoint storage backed by SQLite.
pub struct CheckpointStore {
    pool: SqlitePool,
    cache: Arc<RwLock<HashMap<String, Timestamp>>>,
    /// Sources with checkpoints not yet persisted
    dirty: Arc<RwLock<HashSet<String>>>,
    path: String,
}

impl CheckpointStore {
    /// Open (or create) the store at `path`. `":memory:"` keeps everything
    /// in process memory.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing checkpoint store");

        let pool = if path_str == IN_MEMORY_PATH {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;
            // One connection that never recycles, or the database vanishes
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(2)
                .connect_with(options)
                .await?
        };

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                sync_key TEXT PRIMARY KEY,
                ts_time INTEGER NOT NULL,
                ts_increment INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, i64, i64)> =
            sqlx::query_as("SELECT sync_key, ts_time, ts_increment FROM checkpoints")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (key, time, increment) in rows {
            if let Some(ts) = timestamp_from_row(&key, time, increment) {
                debug!(key = %key, checkpoint = %ts, "Loaded checkpoint from disk");
                cache.insert(key, ts);
            }
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
            path: path_str,
        })
    }

    /// Last recorded checkpoint under `key`, if any.
    pub async fn get(&self, key: &str) -> Option<Timestamp> {
        self.cache.read().await.get(key).copied()
    }

    /// Record a checkpoint (debounced).
    ///
    /// Updates the cache immediately and marks the key dirty; call
    /// `flush_dirty()` to persist.
    pub async fn set(&self, key: &str, checkpoint: Timestamp) {
        {
            let mut cache = self.cache.write().await;
            cache.insert(key.to_string(), checkpoint);
        }
        {
            let mut dirty = self.dirty.write().await;
            dirty.insert(key.to_string());
        }
        crate::metrics::set_checkpoint(checkpoint);
        debug!(key = %key, checkpoint = %checkpoint, "Checkpoint updated (pending flush)");
    }

    /// Flush all dirty checkpoints to disk.
    ///
    /// Returns the number of checkpoints flushed.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty_keys: Vec<String> = {
            let mut dirty = self.dirty.write().await;
            dirty.drain().collect()
        };

        if dirty_keys.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let pending: Vec<(String, Timestamp)> = {
            let cache = self.cache.read().await;
            dirty_keys
                .iter()
                .filter_map(|id| cache.get(id).map(|ts| (id.clone(), *ts)))
                .collect()
        };
        let pool = &self.pool;

        let mut flushed = 0;
        let mut errors = 0;

        for (key, checkpoint) in pending {
            let result = execute_with_retry("checkpoint_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO checkpoints (sync_key, ts_time, ts_increment, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(sync_key) DO UPDATE SET
                        ts_time = excluded.ts_time,
                        ts_increment = excluded.ts_increment,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&key)
                .bind(i64::from(checkpoint.time))
                .bind(i64::from(checkpoint.increment))
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(key = %key, error = %e, "Failed to flush checkpoint");
                    // Re-mark so the next flush retries
                    self.dirty.write().await.insert(key);
                }
            }
        }

        if flushed > 0 || errors > 0 {
            debug!(flushed, errors, "Flushed dirty checkpoints");
            crate::metrics::record_checkpoint_flush(flushed, errors);
        }

        if errors > 0 {
            return Err(ReplicationError::Internal(format!(
                "Failed to flush {} checkpoints",
                errors
            )));
        }

        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn wal_checkpoint(&self) -> Result<()> {
        if self.path == IN_MEMORY_PATH {
            return Ok(());
        }
        let pool = &self.pool;

        execute_with_retry("wal_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Flush, checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) if count > 0 => info!(count, "Flushed dirty checkpoints on close"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to flush dirty checkpoints on close"),
            }
        }

        if let Err(e) = self.wal_checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_checkpoint_store_basic() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("checkpoints.db");

        let store = CheckpointStore::new(&db_path).await.unwrap();
        assert!(store.get("mongodb://src").await.is_none());

        store.set("mongodb://src", Timestamp::new(100, 1)).await;
        assert_eq!(store.get("mongodb://src").await, Some(Timestamp::new(100, 1)));
        assert!(store.has_dirty().await);

        store.set("mongodb://src", Timestamp::new(100, 2)).await;
        assert_eq!(store.get("mongodb://src").await, Some(Timestamp::new(100, 2)));

        let flushed = store.flush_dirty().await.unwrap();
        assert_eq!(flushed, 1);
        assert!(!store.has_dirty().await);

        store.close().await;
    }

    #[tokio::test]
    async fn test_checkpoint_store_persistence() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("persist.db");

        {
            let store = CheckpointStore::new(&db_path).await.unwrap();
            store.set("src", Timestamp::new(1_700_000_000, 42)).await;
            store.flush_dirty().await.unwrap();
            store.close().await;
        }

        {
            let store = CheckpointStore::new(&db_path).await.unwrap();
            assert_eq!(store.get("src").await, Some(Timestamp::new(1_700_000_000, 42)));
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_checkpoint_store_close_flushes_dirty() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("close_flush.db");

        {
            let store = CheckpointStore::new(&db_path).await.unwrap();
            store.set("src", Timestamp::new(999, 0)).await;
            store.close().await;
        }

        {
            let store = CheckpointStore::new(&db_path).await.unwrap();
            assert_eq!(store.get("src").await, Some(Timestamp::new(999, 0)));
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_checkpoint_debounce_multiple_updates() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("debounce.db")).await.unwrap();

        store.set("src", Timestamp::new(1, 1)).await;
        store.set("src", Timestamp::new(1, 2)).await;
        store.set("src", Timestamp::new(2, 1)).await;

        assert!(store.has_dirty().await);
        assert_eq!(store.get("src").await, Some(Timestamp::new(2, 1)));
        assert_eq!(store.flush_dirty().await.unwrap(), 1);
        assert_eq!(store.flush_dirty().await.unwrap(), 0);

        store.close().await;
    }

    #[tokio::test]
    async fn test_checkpoint_store_multiple_keys() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("multi.db")).await.unwrap();

        for i in 0..5u32 {
            store.set(&format!("src-{}", i), Timestamp::new(i * 100, i)).await;
        }
        assert!(store.has_dirty().await);
        assert_eq!(store.flush_dirty().await.unwrap(), 5);

        for i in 0..5u32 {
            assert_eq!(
                store.get(&format!("src-{}", i)).await,
                Some(Timestamp::new(i * 100, i))
            );
        }

        store.close().await;
    }

    #[tokio::test]
    async fn test_checkpoint_store_in_memory() {
        let store = CheckpointStore::new(":memory:").await.unwrap();
        store.set("src", Timestamp::new(5, 5)).await;
        assert_eq!(store.flush_dirty().await.unwrap(), 1);
        assert_eq!(store.get("src").await, Some(Timestamp::new(5, 5)));
        assert_eq!(store.path(), ":memory:");
        store.close().await;
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }

    #[test]
    fn test_is_sqlite_busy_error_non_database() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn test_timestamp_from_row_range() {
        assert_eq!(timestamp_from_row("s", 10, 2), Some(Timestamp::new(10, 2)));
        assert_eq!(timestamp_from_row("s", -1, 0), None);
        assert_eq!(timestamp_from_row("s", i64::from(u32::MAX) + 1, 0), None);
    }
}
