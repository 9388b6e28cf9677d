//! # Coral Store
//!
//! DuckDB-based local persistence for the Coral client core.
//!
//! ## Overview
//!
//! This crate is the durable half of Coral's offline support. It stores two
//! things on behalf of `coral-core`:
//!
//! - the **pending-operation queue**: mutations that failed while offline and
//!   are waiting to be replayed
//! - the **read cache**: opaque response payloads keyed by request identity,
//!   used as a fallback when a read fails
//!
//! The store is deliberately small: a namespaced, single-writer surface with
//! whole-queue rewrites on every persist. Loading corrupt data degrades to an
//! empty (or partial) result, never a crash.
//!
//! ## Tables
//!
//! | Table | Description |
//! |-------|-------------|
//! | `pending_operations` | Queued mutations in enqueue (position) order |
//! | `cache_entries` | Read-fallback payloads with their cache timestamps |
//! | `schema_migrations` | Applied migration ledger |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use coral_store::{OfflineStore, QueuedOperationRecord};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = OfflineStore::open_default()?;
//!
//!     let pending = store.load_queue()?;
//!     println!("{} operation(s) waiting for replay", pending.len());
//!
//!     Ok(())
//! }
//! ```

pub mod migrations;
pub mod models;
pub mod pool;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ::duckdb::ToSql;
use thiserror::Error;

pub use models::{CacheRecord, QueuedOperationRecord};
pub use pool::{ConnectionPool, PooledConnection};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `DuckDB` database error.
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    /// I/O error (file system operations).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Configuration for the offline store database.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for Coral data.
    pub coral_home: PathBuf,
    /// Path to the `DuckDB` database file.
    pub db_path: PathBuf,
    /// Maximum number of connections in the pool.
    pub max_pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let coral_home = resolve_coral_home();
        let db_path = coral_home.join("offline").join("coral.duckdb");
        Self {
            coral_home,
            db_path,
            max_pool_size: 2,
        }
    }
}

/// The durable store backing the offline queue and read cache.
#[derive(Clone)]
pub struct OfflineStore {
    config: StoreConfig,
    pool: ConnectionPool,
}

impl OfflineStore {
    /// Open a store with default configuration.
    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(StoreConfig::default())
    }

    /// Open a store with the specified configuration.
    ///
    /// An unreadable or corrupt database file is removed and recreated empty:
    /// a client that cannot load its queue must still start.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let pool = ConnectionPool::new(config.db_path.clone(), config.max_pool_size);
        let store = Self { config, pool };

        if let Err(error) = store.initialize() {
            log::warn!(
                "offline store at {} is unusable ({error}); resetting to an empty store",
                store.config.db_path.display()
            );
            store.reset_database_file()?;
            store.initialize()?;
        }

        Ok(store)
    }

    /// Apply schema migrations.
    pub fn initialize(&self) -> Result<(), StoreError> {
        let connection = self.pool.acquire()?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    /// Get the path to the database file.
    pub fn db_path(&self) -> &Path {
        self.pool.db_path()
    }

    /// Replace the entire pending queue with the given records, preserving
    /// their slice order as replay order.
    ///
    /// The queue is always rewritten whole, mirroring the original
    /// serialize-the-full-queue persistence contract.
    pub fn replace_queue(&self, records: &[QueuedOperationRecord]) -> Result<(), StoreError> {
        let connection = self.pool.acquire()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<(), StoreError> {
            connection.execute_batch("DELETE FROM pending_operations")?;

            for (position, record) in records.iter().enumerate() {
                let position = position as i64;
                let payload = record.payload.to_string();
                let retry_count = i64::from(record.retry_count);
                let max_retries = i64::from(record.max_retries);

                let params: [&dyn ToSql; 8] = [
                    &position,
                    &record.id,
                    &record.op_type,
                    &record.target_table,
                    &payload,
                    &record.enqueued_at_ms,
                    &retry_count,
                    &max_retries,
                ];
                connection.execute(
                    "INSERT INTO pending_operations \
                     (position, id, op_type, target_table, payload, enqueued_at_ms, retry_count, max_retries) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    params.as_slice(),
                )?;
            }

            Ok(())
        })();

        finalize_transaction(&connection, result)
    }

    /// Load the pending queue in replay order.
    ///
    /// Rows whose payload no longer parses as JSON are skipped: corrupt
    /// entries degrade to the surviving subset instead of failing the load.
    pub fn load_queue(&self) -> Result<Vec<QueuedOperationRecord>, StoreError> {
        let connection = self.pool.acquire()?;
        let mut statement = connection.prepare(
            "SELECT id, op_type, target_table, payload, enqueued_at_ms, retry_count, max_retries \
             FROM pending_operations ORDER BY position",
        )?;

        let rows = statement.query_map([], |row| {
            Ok(RawQueueRow {
                id: row.get(0)?,
                op_type: row.get(1)?,
                target_table: row.get(2)?,
                payload: row.get(3)?,
                enqueued_at_ms: row.get(4)?,
                retry_count: row.get(5)?,
                max_retries: row.get(6)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            let row = row?;
            match serde_json::from_str(&row.payload) {
                Ok(payload) => records.push(QueuedOperationRecord {
                    id: row.id,
                    op_type: row.op_type,
                    target_table: row.target_table,
                    payload,
                    enqueued_at_ms: row.enqueued_at_ms,
                    retry_count: clamp_count(row.retry_count),
                    max_retries: clamp_count(row.max_retries),
                }),
                Err(error) => {
                    log::warn!("dropping queued operation '{}' with corrupt payload: {error}", row.id);
                }
            }
        }

        Ok(records)
    }

    /// Number of persisted pending operations.
    pub fn queue_len(&self) -> Result<usize, StoreError> {
        let connection = self.pool.acquire()?;
        let count: i64 =
            connection.query_row("SELECT COUNT(*) FROM pending_operations", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Remove every pending operation.
    pub fn clear_queue(&self) -> Result<(), StoreError> {
        let connection = self.pool.acquire()?;
        connection.execute_batch("DELETE FROM pending_operations")?;
        Ok(())
    }

    /// Insert or overwrite a cache entry.
    pub fn cache_put(&self, record: &CacheRecord) -> Result<(), StoreError> {
        let connection = self.pool.acquire()?;
        let data = record.data.to_string();
        let params: [&dyn ToSql; 3] = [&record.cache_key, &data, &record.cached_at_ms];
        connection.execute(
            "INSERT OR REPLACE INTO cache_entries (cache_key, data, cached_at_ms) VALUES (?, ?, ?)",
            params.as_slice(),
        )?;
        Ok(())
    }

    /// Fetch a cache entry by key. Staleness is the caller's concern.
    ///
    /// A corrupt entry is evicted and reported as a miss.
    pub fn cache_get(&self, cache_key: &str) -> Result<Option<CacheRecord>, StoreError> {
        let connection = self.pool.acquire()?;
        let mut statement = connection
            .prepare("SELECT data, cached_at_ms FROM cache_entries WHERE cache_key = ?")?;

        let params: [&dyn ToSql; 1] = [&cache_key];
        let mut rows = statement.query_map(params.as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let Some(row) = rows.next() else {
            return Ok(None);
        };
        let (data, cached_at_ms) = row?;

        match serde_json::from_str(&data) {
            Ok(data) => Ok(Some(CacheRecord {
                cache_key: cache_key.to_owned(),
                data,
                cached_at_ms,
            })),
            Err(error) => {
                log::warn!("evicting corrupt cache entry '{cache_key}': {error}");
                drop(rows);
                drop(statement);
                drop(connection);
                self.cache_delete(cache_key)?;
                Ok(None)
            }
        }
    }

    /// Remove a cache entry. Returns whether an entry was present.
    pub fn cache_delete(&self, cache_key: &str) -> Result<bool, StoreError> {
        let connection = self.pool.acquire()?;
        let params: [&dyn ToSql; 1] = [&cache_key];
        let removed =
            connection.execute("DELETE FROM cache_entries WHERE cache_key = ?", params.as_slice())?;
        Ok(removed > 0)
    }

    /// Evict cache entries stored strictly before the cutoff timestamp.
    /// Returns how many entries were removed.
    pub fn evict_cache_older_than(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let connection = self.pool.acquire()?;
        let params: [&dyn ToSql; 1] = [&cutoff_ms];
        let removed = connection.execute(
            "DELETE FROM cache_entries WHERE cached_at_ms < ?",
            params.as_slice(),
        )?;
        Ok(removed)
    }

    /// Remove every cache entry.
    pub fn clear_cache(&self) -> Result<(), StoreError> {
        let connection = self.pool.acquire()?;
        connection.execute_batch("DELETE FROM cache_entries")?;
        Ok(())
    }

    fn reset_database_file(&self) -> Result<(), StoreError> {
        self.pool.drain();

        if self.config.db_path.exists() {
            fs::remove_file(&self.config.db_path)?;
        }

        // DuckDB may leave a write-ahead log next to the database file.
        let wal_path = PathBuf::from(format!("{}.wal", self.config.db_path.display()));
        if wal_path.exists() {
            fs::remove_file(&wal_path)?;
        }

        Ok(())
    }
}

struct RawQueueRow {
    id: String,
    op_type: String,
    target_table: String,
    payload: String,
    enqueued_at_ms: i64,
    retry_count: i64,
    max_retries: i64,
}

/// Finalize a transaction, committing on success or rolling back on failure.
fn finalize_transaction<T>(
    connection: &::duckdb::Connection,
    result: Result<T, StoreError>,
) -> Result<T, StoreError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

fn clamp_count(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn resolve_coral_home() -> PathBuf {
    if let Ok(home) = env::var("CORAL_HOME") {
        return PathBuf::from(home);
    }

    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home).join(".coral");
    }

    PathBuf::from(".coral")
}
