//! `download_log`: append-only trail of fetch attempts.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use tracing::instrument;

use super::{Result, Store, StoreError, decode_time, encode_time};

/// Outcome of one fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Bytes were fetched and committed.
    Downloaded,
    /// The local copy was trusted; no transfer happened.
    Skipped,
    /// The attempt failed; the live file is untouched.
    Failed,
}

impl DownloadStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Downloaded => "downloaded",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "downloaded" => Ok(Self::Downloaded),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid download status: {s}")),
        }
    }
}

/// One fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadEvent {
    /// Fresh time-ordered identifier per attempt.
    pub fetch_id: String,
    /// Remote object name.
    pub file_name: String,
    /// Remote fingerprint the attempt expected.
    pub remote_fingerprint: Option<String>,
    /// SHA-256 of the resulting local bytes; `None` on failure.
    pub content_fingerprint: Option<String>,
    /// When the attempt finished.
    pub fetch_time: DateTime<Utc>,
    /// Outcome.
    pub status: DownloadStatus,
    /// Local digest vs remote fingerprint; `None` when not comparable.
    pub fingerprint_match: Option<bool>,
    /// Live path of the file.
    pub local_path: Option<PathBuf>,
}

impl DownloadEvent {
    /// Generates a new fetch identifier (UUIDv7, time ordered).
    #[must_use]
    pub fn new_fetch_id() -> String {
        uuid7::uuid7().to_string()
    }

    /// Builds a failed event for `file_name`.
    #[must_use]
    pub fn failed(file_name: &str, remote_fingerprint: Option<&str>, local_path: PathBuf) -> Self {
        Self {
            fetch_id: Self::new_fetch_id(),
            file_name: file_name.to_string(),
            remote_fingerprint: remote_fingerprint.map(str::to_string),
            content_fingerprint: None,
            fetch_time: Utc::now(),
            status: DownloadStatus::Failed,
            fingerprint_match: None,
            local_path: Some(local_path),
        }
    }
}

#[derive(Debug, FromRow)]
struct DownloadEventRow {
    fetch_id: String,
    file_name: String,
    remote_fingerprint: Option<String>,
    content_fingerprint: Option<String>,
    fetch_time: String,
    status: String,
    fingerprint_match: Option<bool>,
    local_path: Option<String>,
}

impl TryFrom<DownloadEventRow> for DownloadEvent {
    type Error = StoreError;

    fn try_from(row: DownloadEventRow) -> Result<Self> {
        let status = row
            .status
            .parse()
            .map_err(|_| StoreError::corrupt("status", row.status.clone()))?;
        Ok(Self {
            fetch_time: decode_time("fetch_time", &row.fetch_time)?,
            status,
            fetch_id: row.fetch_id,
            file_name: row.file_name,
            remote_fingerprint: row.remote_fingerprint,
            content_fingerprint: row.content_fingerprint,
            fingerprint_match: row.fingerprint_match,
            local_path: row.local_path.map(PathBuf::from),
        })
    }
}

const SELECT_EVENTS: &str = r"SELECT fetch_id, file_name, remote_fingerprint, content_fingerprint,
                                     fetch_time, status, fingerprint_match, local_path
                              FROM download_log";

impl Store {
    /// Appends one fetch attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert fails (including a reused `fetch_id`).
    #[instrument(skip(self, event), fields(file = %event.file_name, status = %event.status))]
    pub async fn append_download_event(&self, event: &DownloadEvent) -> Result<()> {
        let local_path = event
            .local_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        let _guard = self.write_guard().await;
        sqlx::query(
            r"INSERT INTO download_log (
                fetch_id, file_name, remote_fingerprint, content_fingerprint,
                fetch_time, status, fingerprint_match, local_path
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.fetch_id)
        .bind(&event.file_name)
        .bind(event.remote_fingerprint.as_deref())
        .bind(event.content_fingerprint.as_deref())
        .bind(encode_time(event.fetch_time))
        .bind(event.status.as_str())
        .bind(event.fingerprint_match)
        .bind(local_path)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// All attempts for one file, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row is corrupt.
    #[instrument(skip(self))]
    pub async fn download_events_for(&self, file_name: &str) -> Result<Vec<DownloadEvent>> {
        let rows: Vec<DownloadEventRow> = sqlx::query_as(&format!(
            "{SELECT_EVENTS} WHERE file_name = ? ORDER BY fetch_time, fetch_id"
        ))
        .bind(file_name)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(DownloadEvent::try_from).collect()
    }

    /// The most recent `limit` attempts across all files, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row is corrupt.
    #[instrument(skip(self))]
    pub async fn recent_download_events(&self, limit: u32) -> Result<Vec<DownloadEvent>> {
        let rows: Vec<DownloadEventRow> = sqlx::query_as(&format!(
            "{SELECT_EVENTS} ORDER BY fetch_time DESC, fetch_id DESC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(DownloadEvent::try_from).collect()
    }

    /// Non-failed attempts that recorded a content fingerprint, oldest first.
    ///
    /// This is the input to duplicate detection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row is corrupt.
    #[instrument(skip(self))]
    pub async fn fingerprinted_download_events(&self) -> Result<Vec<DownloadEvent>> {
        let rows: Vec<DownloadEventRow> = sqlx::query_as(&format!(
            "{SELECT_EVENTS}
             WHERE content_fingerprint IS NOT NULL AND status != 'failed'
             ORDER BY fetch_time, fetch_id"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(DownloadEvent::try_from).collect()
    }

    /// Number of attempts recorded for one file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn count_download_events(&self, file_name: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM download_log WHERE file_name = ?")
                .bind(file_name)
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }
}
