//! `duplicate_log`: files retired by deduplication.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use tracing::instrument;

use super::{Result, Store, StoreError, decode_time, encode_time};

/// One retired duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateRecord {
    /// Row id.
    pub id: i64,
    /// Surviving file of the group.
    pub retained_file: String,
    /// File that was retired.
    pub removed_file: String,
    /// `duplicate (<policy>)`.
    pub reason: String,
    /// When the file was retired.
    pub removal_time: DateTime<Utc>,
}

/// A retired file name and the remote fingerprint it had when retired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetiredFile {
    /// Retired file name.
    pub file_name: String,
    /// Last remote fingerprint seen for it before retirement, if any.
    pub remote_fingerprint: Option<String>,
}

#[derive(Debug, FromRow)]
struct DuplicateRow {
    id: i64,
    retained_file: String,
    removed_file: String,
    reason: String,
    removal_time: String,
}

impl TryFrom<DuplicateRow> for DuplicateRecord {
    type Error = StoreError;

    fn try_from(row: DuplicateRow) -> Result<Self> {
        Ok(Self {
            removal_time: decode_time("removal_time", &row.removal_time)?,
            id: row.id,
            retained_file: row.retained_file,
            removed_file: row.removed_file,
            reason: row.reason,
        })
    }
}

impl Store {
    /// Retires `removed_file`: deletes its metadata row and appends a
    /// duplicate record in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if either write fails; neither is applied then.
    #[instrument(skip(self, reason))]
    pub async fn retire_duplicate(
        &self,
        retained_file: &str,
        removed_file: &str,
        reason: &str,
        removal_time: DateTime<Utc>,
    ) -> Result<DuplicateRecord> {
        let _guard = self.write_guard().await;
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM file_metadata WHERE file_name = ?")
            .bind(removed_file)
            .execute(&mut *tx)
            .await?;

        let (id,): (i64,) = sqlx::query_as(
            r"INSERT INTO duplicate_log (retained_file, removed_file, reason, removal_time)
              VALUES (?, ?, ?, ?)
              RETURNING id",
        )
        .bind(retained_file)
        .bind(removed_file)
        .bind(reason)
        .bind(encode_time(removal_time))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(DuplicateRecord {
            id,
            retained_file: retained_file.to_string(),
            removed_file: removed_file.to_string(),
            reason: reason.to_string(),
            removal_time,
        })
    }

    /// All duplicate records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row is corrupt.
    pub async fn list_duplicate_records(&self) -> Result<Vec<DuplicateRecord>> {
        let rows: Vec<DuplicateRow> = sqlx::query_as(
            r"SELECT id, retained_file, removed_file, reason, removal_time
              FROM duplicate_log ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(DuplicateRecord::try_from).collect()
    }

    /// Files currently retired: removed by deduplication and not fetched
    /// back since (no metadata row).
    ///
    /// Each carries the last non-failed remote fingerprint recorded for it
    /// at or before its latest retirement.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    #[instrument(skip(self))]
    pub async fn retired_files(&self) -> Result<Vec<RetiredFile>> {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(
            r"SELECT d.removed_file,
                     (SELECT l.remote_fingerprint
                        FROM download_log l
                       WHERE l.file_name = d.removed_file
                         AND l.status != 'failed'
                         AND l.fetch_time <= d.removal_time
                       ORDER BY l.fetch_time DESC, l.fetch_id DESC
                       LIMIT 1)
                FROM duplicate_log d
               WHERE d.id = (SELECT MAX(x.id) FROM duplicate_log x
                              WHERE x.removed_file = d.removed_file)
                 AND NOT EXISTS (SELECT 1 FROM file_metadata m
                                  WHERE m.file_name = d.removed_file)
               ORDER BY d.removed_file",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(file_name, remote_fingerprint)| RetiredFile {
                file_name,
                remote_fingerprint,
            })
            .collect())
    }
}
