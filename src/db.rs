//! Database connection and schema management.
//!
//! This module provides SQLite connectivity for the sync log database:
//! - Connection pool management
//! - WAL mode for concurrent reads
//! - Automatic migration execution (one canonical, versioned schema)
//!
//! # Example
//!
//! ```no_run
//! use tripsync_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("tripsync-log.db")).await?;
//! // Hand the database to a Store...
//! db.close().await;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

/// Default maximum number of connections in the pool.
/// Kept low for SQLite since it uses file-level locking.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds.
/// Connections will wait this long before returning SQLITE_BUSY.
pub const DEFAULT_BUSY_TIMEOUT_MS: u32 = 5000;

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Pool tuning for file-backed databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseOptions {
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// `PRAGMA busy_timeout` in milliseconds.
    pub busy_timeout_ms: u32,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Database connection wrapper with connection pool.
///
/// Handles SQLite connection pooling, WAL mode configuration,
/// and automatic migration execution.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the database at `db_path` with default options.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        Self::with_options(db_path, DatabaseOptions::default()).await
    }

    /// Opens the database at `db_path` with explicit pool options.
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Enable WAL mode for concurrent reads
    /// 3. Run any pending migrations
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn with_options(db_path: &Path, options: DatabaseOptions) -> Result<Self, DbError> {
        let db = Self::open_unmigrated(db_path, options).await?;
        sqlx::migrate!("./migrations").run(&db.pool).await?;
        Ok(db)
    }

    /// Opens the database at `db_path` without applying the log schema.
    ///
    /// Used for the warehouse, whose tables are created by the loader.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn open_unmigrated(db_path: &Path, options: DatabaseOptions) -> Result<Self, DbError> {
        // Pragmas go on the connect options so every pooled connection gets them
        let connect_options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(u64::from(options.busy_timeout_ms)));

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .connect_with(connect_options)
            .await?;

        Ok(Self { pool })
    }

    /// Creates an in-memory database for testing.
    ///
    /// A single connection is used so every query sees the same
    /// in-memory database.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Checks if WAL mode is enabled.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the query fails.
    #[instrument(skip(self))]
    pub async fn is_wal_enabled(&self) -> Result<bool, DbError> {
        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;

        Ok(result.0.to_lowercase() == "wal")
    }

    /// Gracefully closes all connections in the pool.
    ///
    /// Call this before the process exits; the `Database` (and every clone
    /// of it) must not be used afterwards.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_new_in_memory_succeeds() {
        let db = Database::new_in_memory().await;
        assert!(db.is_ok(), "Failed to create in-memory database");
    }

    #[tokio::test]
    async fn test_database_file_metadata_table_exists() {
        let db = Database::new_in_memory().await.unwrap();

        let result = sqlx::query(
            "INSERT INTO file_metadata (file_name, size, last_modified, remote_fingerprint, fetch_time)
             VALUES ('a.zip', 1, '2024-01-01T00:00:00.000000Z', 'e1', '2024-01-01T00:00:00.000000Z')",
        )
        .execute(db.pool())
        .await;

        assert!(result.is_ok(), "file_metadata should exist after migration");
    }

    #[tokio::test]
    async fn test_database_download_log_rejects_unknown_status() {
        let db = Database::new_in_memory().await.unwrap();

        let result = sqlx::query(
            "INSERT INTO download_log (fetch_id, file_name, fetch_time, status)
             VALUES ('id-1', 'a.zip', '2024-01-01T00:00:00.000000Z', 'exploded')",
        )
        .execute(db.pool())
        .await;

        assert!(
            result.is_err(),
            "Invalid status should be rejected by CHECK constraint"
        );
    }

    #[tokio::test]
    async fn test_database_download_log_is_append_only() {
        let db = Database::new_in_memory().await.unwrap();

        sqlx::query(
            "INSERT INTO download_log (fetch_id, file_name, fetch_time, status)
             VALUES ('id-1', 'a.zip', '2024-01-01T00:00:00.000000Z', 'failed')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let result = sqlx::query("UPDATE download_log SET status = 'downloaded'")
            .execute(db.pool())
            .await;

        assert!(result.is_err(), "download_log rows must not be updated");
    }

    #[tokio::test]
    async fn test_database_with_tempfile_enables_wal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let db = Database::new(&db_path).await.unwrap();
        assert!(db.is_wal_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_open_unmigrated_has_no_log_tables() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("warehouse.db");

        let db = Database::open_unmigrated(&db_path, DatabaseOptions::default())
            .await
            .unwrap();
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'file_metadata'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(count, 0);
        assert!(db.is_wal_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_database_with_options_single_connection() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("opts.db");
        let options = DatabaseOptions {
            max_connections: 1,
            busy_timeout_ms: 100,
        };

        let db = Database::with_options(&db_path, options).await.unwrap();
        let result: (i64,) = sqlx::query_as("SELECT 1").fetch_one(db.pool()).await.unwrap();
        assert_eq!(result.0, 1);
        db.close().await;
    }
}
