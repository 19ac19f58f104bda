//! `rollback_log`: one row per archived file.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use tracing::instrument;

use super::{Result, Store, StoreError, decode_time, encode_time};

/// A backup taken before a live file was overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackRecord {
    /// `<file_name>-<timestamp>[-<seq>]`.
    pub rollback_id: String,
    /// File that was archived.
    pub file_name: String,
    /// Fingerprint of the archived bytes.
    pub replaced_content_fingerprint: Option<String>,
    /// When the archived bytes were replaced.
    pub replaced_time: DateTime<Utc>,
    /// Fingerprint of the bytes that replaced them.
    pub new_content_fingerprint: Option<String>,
    /// When the replacement was staged.
    pub new_time: DateTime<Utc>,
    /// Why the replacement was archived.
    pub reason: String,
    /// Backup file holding the archived bytes.
    pub backup_path: PathBuf,
}

#[derive(Debug, FromRow)]
struct RollbackRow {
    rollback_id: String,
    file_name: String,
    replaced_content_fingerprint: Option<String>,
    replaced_time: String,
    new_content_fingerprint: Option<String>,
    new_time: String,
    reason: String,
    backup_path: String,
}

impl TryFrom<RollbackRow> for RollbackRecord {
    type Error = StoreError;

    fn try_from(row: RollbackRow) -> Result<Self> {
        Ok(Self {
            replaced_time: decode_time("replaced_time", &row.replaced_time)?,
            new_time: decode_time("new_time", &row.new_time)?,
            rollback_id: row.rollback_id,
            file_name: row.file_name,
            replaced_content_fingerprint: row.replaced_content_fingerprint,
            new_content_fingerprint: row.new_content_fingerprint,
            reason: row.reason,
            backup_path: PathBuf::from(row.backup_path),
        })
    }
}

const SELECT_ROLLBACKS: &str = r"SELECT rollback_id, file_name, replaced_content_fingerprint,
                                        replaced_time, new_content_fingerprint, new_time,
                                        reason, backup_path
                                 FROM rollback_log";

impl Store {
    /// Appends a rollback record. The backup must already be on disk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert fails.
    #[instrument(skip(self, record), fields(rollback_id = %record.rollback_id))]
    pub async fn insert_rollback_record(&self, record: &RollbackRecord) -> Result<()> {
        let _guard = self.write_guard().await;
        sqlx::query(
            r"INSERT INTO rollback_log (
                rollback_id, file_name, replaced_content_fingerprint, replaced_time,
                new_content_fingerprint, new_time, reason, backup_path
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.rollback_id)
        .bind(&record.file_name)
        .bind(record.replaced_content_fingerprint.as_deref())
        .bind(encode_time(record.replaced_time))
        .bind(record.new_content_fingerprint.as_deref())
        .bind(encode_time(record.new_time))
        .bind(&record.reason)
        .bind(record.backup_path.to_string_lossy().into_owned())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Looks up a rollback record by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or the row is corrupt.
    #[instrument(skip(self))]
    pub async fn get_rollback_record(&self, rollback_id: &str) -> Result<Option<RollbackRecord>> {
        let row: Option<RollbackRow> =
            sqlx::query_as(&format!("{SELECT_ROLLBACKS} WHERE rollback_id = ?"))
                .bind(rollback_id)
                .fetch_optional(self.pool())
                .await?;
        row.map(RollbackRecord::try_from).transpose()
    }

    /// The most recent `limit` rollback records, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row is corrupt.
    #[instrument(skip(self))]
    pub async fn recent_rollback_records(&self, limit: u32) -> Result<Vec<RollbackRecord>> {
        let rows: Vec<RollbackRow> = sqlx::query_as(&format!(
            "{SELECT_ROLLBACKS} ORDER BY replaced_time DESC, rollback_id DESC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(RollbackRecord::try_from).collect()
    }

    /// All rollback records for one file, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row is corrupt.
    pub async fn rollback_records_for(&self, file_name: &str) -> Result<Vec<RollbackRecord>> {
        let rows: Vec<RollbackRow> = sqlx::query_as(&format!(
            "{SELECT_ROLLBACKS} WHERE file_name = ? ORDER BY replaced_time, rollback_id"
        ))
        .bind(file_name)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(RollbackRecord::try_from).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::TimeZone;

    fn record(id: &str, minute: u32) -> RollbackRecord {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap();
        RollbackRecord {
            rollback_id: id.to_string(),
            file_name: "a.zip".to_string(),
            replaced_content_fingerprint: Some("old".to_string()),
            replaced_time: at,
            new_content_fingerprint: Some("new".to_string()),
            new_time: at,
            reason: "Smaller file detected".to_string(),
            backup_path: PathBuf::from(format!("rollback/a.zip/{id}.bak")),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = Store::new(Database::new_in_memory().await.unwrap());
        let r = record("a.zip-1", 0);
        store.insert_rollback_record(&r).await.unwrap();
        assert_eq!(store.get_rollback_record("a.zip-1").await.unwrap(), Some(r));
        assert_eq!(store.get_rollback_record("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recent_is_newest_first_and_limited() {
        let store = Store::new(Database::new_in_memory().await.unwrap());
        for minute in 0..4 {
            store
                .insert_rollback_record(&record(&format!("a.zip-{minute}"), minute))
                .await
                .unwrap();
        }
        let ids: Vec<String> = store
            .recent_rollback_records(2)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.rollback_id)
            .collect();
        assert_eq!(ids, vec!["a.zip-3", "a.zip-2"]);
        assert_eq!(store.rollback_records_for("a.zip").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_rollback_id_is_unique() {
        let store = Store::new(Database::new_in_memory().await.unwrap());
        store.insert_rollback_record(&record("dup", 0)).await.unwrap();
        assert!(store.insert_rollback_record(&record("dup", 1)).await.is_err());
    }
}
