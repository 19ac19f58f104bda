//! `file_metadata`: last-known-good state per remote file name.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use tracing::instrument;

use super::{Result, Store, decode_time, encode_time, from_sql_size, to_sql_size};

/// Authoritative last-known-good state of one remote file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMetadataRecord {
    /// Remote object name; primary key.
    pub file_name: String,
    /// Size in bytes as listed remotely.
    pub size: u64,
    /// Remote last-modified time.
    pub last_modified: DateTime<Utc>,
    /// Remote fingerprint (normalized ETag).
    pub remote_fingerprint: String,
    /// SHA-256 of the local bytes, when known.
    pub content_fingerprint: Option<String>,
    /// When the local bytes were last fetched, accepted or restored.
    pub fetch_time: DateTime<Utc>,
    /// Fetch that produced the local bytes; `None` after a restore.
    pub fetch_id: Option<String>,
}

#[derive(Debug, FromRow)]
struct MetadataRow {
    file_name: String,
    size: i64,
    last_modified: String,
    remote_fingerprint: String,
    content_fingerprint: Option<String>,
    fetch_time: String,
    fetch_id: Option<String>,
}

impl TryFrom<MetadataRow> for FileMetadataRecord {
    type Error = super::StoreError;

    fn try_from(row: MetadataRow) -> Result<Self> {
        Ok(Self {
            size: from_sql_size("size", row.size)?,
            last_modified: decode_time("last_modified", &row.last_modified)?,
            fetch_time: decode_time("fetch_time", &row.fetch_time)?,
            file_name: row.file_name,
            remote_fingerprint: row.remote_fingerprint,
            content_fingerprint: row.content_fingerprint,
            fetch_id: row.fetch_id,
        })
    }
}

const SELECT_METADATA: &str = r"SELECT file_name, size, last_modified, remote_fingerprint,
                                       content_fingerprint, fetch_time, fetch_id
                                FROM file_metadata";

impl Store {
    /// Loads every metadata row, ordered by file name.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError`] if the query fails or a row is corrupt.
    #[instrument(skip(self))]
    pub async fn load_all_metadata(&self) -> Result<Vec<FileMetadataRecord>> {
        let rows: Vec<MetadataRow> =
            sqlx::query_as(&format!("{SELECT_METADATA} ORDER BY file_name"))
                .fetch_all(self.pool())
                .await?;
        rows.into_iter().map(FileMetadataRecord::try_from).collect()
    }

    /// Looks up one file's metadata.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError`] if the query fails or the row is corrupt.
    #[instrument(skip(self))]
    pub async fn get_metadata(&self, file_name: &str) -> Result<Option<FileMetadataRecord>> {
        let row: Option<MetadataRow> =
            sqlx::query_as(&format!("{SELECT_METADATA} WHERE file_name = ?"))
                .bind(file_name)
                .fetch_optional(self.pool())
                .await?;
        row.map(FileMetadataRecord::try_from).transpose()
    }

    /// Inserts or replaces the row keyed by `record.file_name`.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError`] if the write fails.
    #[instrument(skip(self, record), fields(file = %record.file_name))]
    pub async fn upsert_metadata(&self, record: &FileMetadataRecord) -> Result<()> {
        let size = to_sql_size("size", record.size)?;
        let _guard = self.write_guard().await;
        sqlx::query(
            r"INSERT INTO file_metadata (
                file_name, size, last_modified, remote_fingerprint,
                content_fingerprint, fetch_time, fetch_id
              )
              VALUES (?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT(file_name) DO UPDATE SET
                size = excluded.size,
                last_modified = excluded.last_modified,
                remote_fingerprint = excluded.remote_fingerprint,
                content_fingerprint = excluded.content_fingerprint,
                fetch_time = excluded.fetch_time,
                fetch_id = excluded.fetch_id",
        )
        .bind(&record.file_name)
        .bind(size)
        .bind(encode_time(record.last_modified))
        .bind(&record.remote_fingerprint)
        .bind(record.content_fingerprint.as_deref())
        .bind(encode_time(record.fetch_time))
        .bind(record.fetch_id.as_deref())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Points a row at restored bytes: sets the content fingerprint, stamps
    /// `fetch_time` and clears `fetch_id`.
    ///
    /// This is the only write that may move a row back to an older
    /// fingerprint. Returns whether a row existed.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError`] if the write fails.
    #[instrument(skip(self, content_fingerprint))]
    pub async fn restore_content_fingerprint(
        &self,
        file_name: &str,
        content_fingerprint: &str,
        restored_at: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.write_guard().await;
        let result = sqlx::query(
            r"UPDATE file_metadata
              SET content_fingerprint = ?, fetch_time = ?, fetch_id = NULL
              WHERE file_name = ?",
        )
        .bind(content_fingerprint)
        .bind(encode_time(restored_at))
        .bind(file_name)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::remote::RemoteObjectRecord;
    use crate::sync::WorkSetPolicy;
    use chrono::TimeZone;

    fn sample(name: &str, size: u64, fingerprint: &str) -> FileMetadataRecord {
        FileMetadataRecord {
            file_name: name.to_string(),
            size,
            last_modified: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
            remote_fingerprint: "e1".to_string(),
            content_fingerprint: Some(fingerprint.to_string()),
            fetch_time: Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap(),
            fetch_id: Some("f-1".to_string()),
        }
    }

    async fn store() -> Store {
        Store::new(Database::new_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_upsert_then_get_round_trips() {
        let store = store().await;
        let record = sample("202401-trip.zip", 1000, "aa");
        store.upsert_metadata(&record).await.unwrap();

        let loaded = store.get_metadata("202401-trip.zip").await.unwrap();
        assert_eq!(loaded, Some(record));
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_row() {
        let store = store().await;
        store
            .upsert_metadata(&sample("a.zip", 1000, "aa"))
            .await
            .unwrap();
        store
            .upsert_metadata(&sample("a.zip", 400, "bb"))
            .await
            .unwrap();

        let all = store.load_all_metadata().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].size, 400);
        assert_eq!(all[0].content_fingerprint.as_deref(), Some("bb"));
    }

    #[tokio::test]
    async fn test_load_all_is_ordered_by_name() {
        let store = store().await;
        for name in ["c.zip", "a.zip", "b.zip"] {
            store.upsert_metadata(&sample(name, 1, "x")).await.unwrap();
        }
        let names: Vec<String> = store
            .load_all_metadata()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.file_name)
            .collect();
        assert_eq!(names, vec!["a.zip", "b.zip", "c.zip"]);
    }

    #[tokio::test]
    async fn test_sub_microsecond_listing_time_is_not_rediffed() {
        let store = store().await;
        let listed = RemoteObjectRecord {
            name: "202401-trip.zip".to_string(),
            size: 1000,
            remote_fingerprint: "e1".to_string(),
            last_modified: Utc.with_ymd_and_hms(2024, 2, 6, 14, 19, 13).unwrap()
                + chrono::Duration::nanoseconds(123_456_789),
        };
        let mut record = sample(&listed.name, listed.size, "aa");
        record.last_modified = listed.last_modified;
        store.upsert_metadata(&record).await.unwrap();

        let known = store.load_all_metadata().await.unwrap();
        assert_eq!(known[0].last_modified, listed.last_modified);
        assert!(WorkSetPolicy::default().select(&[listed], &known).is_empty());
    }

    #[tokio::test]
    async fn test_restore_content_fingerprint_clears_fetch_id() {
        let store = store().await;
        store
            .upsert_metadata(&sample("a.zip", 1, "new"))
            .await
            .unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        assert!(
            store
                .restore_content_fingerprint("a.zip", "old", now)
                .await
                .unwrap()
        );
        let row = store.get_metadata("a.zip").await.unwrap().unwrap();
        assert_eq!(row.content_fingerprint.as_deref(), Some("old"));
        assert_eq!(row.fetch_time, now);
        assert_eq!(row.fetch_id, None);

        assert!(
            !store
                .restore_content_fingerprint("absent.zip", "old", now)
                .await
                .unwrap()
        );
    }
}
