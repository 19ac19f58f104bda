//! `ingestion_log`: one row per warehouse load attempt.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use tracing::instrument;

use super::{Result, Store, StoreError, decode_time, encode_time, from_sql_size, to_sql_size};

/// Outcome of one load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    /// Rows were committed.
    Success,
    /// The load could not run (unreadable file, database failure).
    Failed,
    /// Strict mode found malformed rows; nothing was committed.
    Rejected,
}

impl IngestionStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for IngestionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("invalid ingestion status: {s}")),
        }
    }
}

/// One warehouse load attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestionLogEntry {
    /// Row id; 0 before insertion.
    pub id: i64,
    /// Delimited file that was loaded.
    pub file_name: String,
    /// Fetch that produced the archive, if any.
    pub fetch_id: Option<String>,
    /// Target table.
    pub table_name: Option<String>,
    /// Whether strict mode was on.
    pub strict: bool,
    /// Load start.
    pub started_at: DateTime<Utc>,
    /// Load end.
    pub finished_at: DateTime<Utc>,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
    /// Outcome.
    pub status: IngestionStatus,
    /// Rows committed.
    pub inserted_rows: u64,
    /// Malformed rows skipped (lenient) or found (strict).
    pub reject_count: u64,
    /// Error text on failure or rejection.
    pub message: Option<String>,
}

#[derive(Debug, FromRow)]
struct IngestionRow {
    id: i64,
    file_name: String,
    fetch_id: Option<String>,
    table_name: Option<String>,
    strict: bool,
    started_at: String,
    finished_at: String,
    duration_ms: i64,
    status: String,
    inserted_rows: i64,
    reject_count: i64,
    message: Option<String>,
}

impl TryFrom<IngestionRow> for IngestionLogEntry {
    type Error = StoreError;

    fn try_from(row: IngestionRow) -> Result<Self> {
        let status = row
            .status
            .parse()
            .map_err(|_| StoreError::corrupt("status", row.status.clone()))?;
        Ok(Self {
            started_at: decode_time("started_at", &row.started_at)?,
            finished_at: decode_time("finished_at", &row.finished_at)?,
            duration_ms: from_sql_size("duration_ms", row.duration_ms)?,
            inserted_rows: from_sql_size("inserted_rows", row.inserted_rows)?,
            reject_count: from_sql_size("reject_count", row.reject_count)?,
            status,
            id: row.id,
            file_name: row.file_name,
            fetch_id: row.fetch_id,
            table_name: row.table_name,
            strict: row.strict,
            message: row.message,
        })
    }
}

impl Store {
    /// Appends a load attempt; returns the new row id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert fails.
    #[instrument(skip(self, entry), fields(file = %entry.file_name, status = %entry.status))]
    pub async fn append_ingestion_entry(&self, entry: &IngestionLogEntry) -> Result<i64> {
        let duration_ms = to_sql_size("duration_ms", entry.duration_ms)?;
        let inserted_rows = to_sql_size("inserted_rows", entry.inserted_rows)?;
        let reject_count = to_sql_size("reject_count", entry.reject_count)?;
        let _guard = self.write_guard().await;
        let (id,): (i64,) = sqlx::query_as(
            r"INSERT INTO ingestion_log (
                file_name, fetch_id, table_name, strict, started_at, finished_at,
                duration_ms, status, inserted_rows, reject_count, message
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(&entry.file_name)
        .bind(entry.fetch_id.as_deref())
        .bind(entry.table_name.as_deref())
        .bind(entry.strict)
        .bind(encode_time(entry.started_at))
        .bind(encode_time(entry.finished_at))
        .bind(duration_ms)
        .bind(entry.status.as_str())
        .bind(inserted_rows)
        .bind(reject_count)
        .bind(entry.message.as_deref())
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    /// The most recent `limit` load attempts, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row is corrupt.
    pub async fn recent_ingestion_entries(&self, limit: u32) -> Result<Vec<IngestionLogEntry>> {
        let rows: Vec<IngestionRow> = sqlx::query_as(
            r"SELECT id, file_name, fetch_id, table_name, strict, started_at, finished_at,
                     duration_ms, status, inserted_rows, reject_count, message
              FROM ingestion_log
              ORDER BY id DESC
              LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(IngestionLogEntry::try_from).collect()
    }
}
