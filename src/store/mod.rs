//! Persistent metadata and audit log store.
//!
//! A single [`Store`] wraps the log database and owns five tables:
//!
//! - `file_metadata` - last-known-good state per file name ([`FileMetadataRecord`])
//! - `download_log` - one row per fetch attempt ([`DownloadEvent`])
//! - `rollback_log` - one row per archived file ([`RollbackRecord`])
//! - `duplicate_log` - one row per retired duplicate ([`DuplicateRecord`])
//! - `ingestion_log` - one row per warehouse load ([`IngestionLogEntry`])
//!
//! Every mutating method takes the store-wide write lock, so concurrent
//! workers never interleave writes. Reads go straight to the pool.
//!
//! Timestamps are stored as fixed-width UTC text
//! (`2024-01-31T23:59:59.000000000Z`) at full nanosecond precision, so
//! lexical order equals time order and listed times round-trip exactly.

mod download_log;
mod duplicate_log;
mod error;
mod ingestion_log;
mod metadata;
mod rollback_log;

pub use download_log::{DownloadEvent, DownloadStatus};
pub use duplicate_log::{DuplicateRecord, RetiredFile};
pub use error::{StoreDbErrorKind, StoreError};
pub use ingestion_log::{IngestionLogEntry, IngestionStatus};
pub use metadata::FileMetadataRecord;
pub use rollback_log::RollbackRecord;

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};

use crate::db::Database;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9fZ";
const TIME_PARSE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

/// Metadata and log store over the sync log database.
#[derive(Debug, Clone)]
pub struct Store {
    db: Database,
    write_lock: Arc<Mutex<()>>,
}

impl Store {
    /// Creates a store over an opened, migrated database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Returns the underlying database.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Acquires the store-wide write lock.
    pub(crate) async fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    fn pool(&self) -> &sqlx::SqlitePool {
        self.db.pool()
    }
}

/// Encodes a UTC timestamp in the stored fixed-width form.
#[must_use]
pub fn encode_time(time: DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Decodes a stored timestamp; RFC 3339 with an offset is also accepted.
///
/// # Errors
///
/// Returns [`StoreError::Corrupt`] naming `column` when the text is not a timestamp.
pub fn decode_time(column: &'static str, raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, TIME_PARSE_FORMAT) {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::corrupt(column, raw))
}

pub(crate) fn to_sql_size(column: &'static str, value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange { column, value })
}

pub(crate) fn from_sql_size(column: &'static str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| StoreError::corrupt(column, value.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_encode_time_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::nanoseconds(1);
        assert_eq!(encode_time(a), "2024-01-02T03:04:05.000000000Z");
        assert_eq!(encode_time(b), "2024-01-02T03:04:05.000000001Z");
        assert!(encode_time(a) < encode_time(b));
    }

    #[test]
    fn test_decode_time_accepts_stored_and_rfc3339() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            decode_time("t", "2024-01-02T03:04:05.000000Z").unwrap(),
            expected
        );
        assert_eq!(decode_time("t", "2024-01-02T03:04:05Z").unwrap(), expected);
        assert_eq!(
            decode_time("t", "2024-01-02T05:04:05+02:00").unwrap(),
            expected
        );
    }

    #[test]
    fn test_decode_time_rejects_garbage() {
        let err = decode_time("fetch_time", "last tuesday").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { column: "fetch_time", .. }));
    }

    #[test]
    fn test_size_conversions() {
        assert_eq!(to_sql_size("size", 10).unwrap(), 10);
        assert!(to_sql_size("size", u64::MAX).is_err());
        assert!(from_sql_size("size", -1).is_err());
    }
}
