//! Archive extraction and tabular ingestion.
//!
//! Both steps sit behind traits so the sync engine can be driven with
//! in-process fakes:
//!
//! - [`ArchiveExtractor`] / [`ZipExtractor`]: unpack a downloaded archive
//! - [`TableLoader`] / [`SqliteTableLoader`]: load one delimited file into
//!   the warehouse, leniently (skip malformed rows) or strictly (reject the
//!   file and roll back)

mod extract;
mod loader;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

pub use extract::ZipExtractor;
pub use loader::{SqliteTableLoader, sanitize_identifier, table_name_for};

/// Errors from extraction and ingestion.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The archive is unreadable or inconsistent.
    #[error("corrupt archive {path}: {message}")]
    CorruptArchive {
        /// Archive path.
        path: PathBuf,
        /// Reader error text.
        message: String,
    },

    /// Filesystem failure.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The header row could not be read.
    #[error("unreadable delimited file {path}: {message}")]
    Unreadable {
        /// File path.
        path: PathBuf,
        /// Reader error text.
        message: String,
    },

    /// Strict mode found malformed rows; nothing was committed.
    #[error("{reject_count} malformed row(s) in {path}, first: {first_error}")]
    MalformedRows {
        /// File path.
        path: PathBuf,
        /// Target table that was rolled back.
        table_name: String,
        /// Malformed rows found.
        reject_count: u64,
        /// Description of the first malformed row.
        first_error: String,
    },

    /// Warehouse database failure.
    #[error("warehouse error: {message}")]
    Warehouse {
        /// Database error text.
        message: String,
    },

    /// A blocking worker panicked or was cancelled.
    #[error("ingestion worker failed: {message}")]
    Worker {
        /// Join error text.
        message: String,
    },
}

impl IngestError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a corrupt-archive error.
    pub fn corrupt_archive(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::CorruptArchive {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        Self::Warehouse {
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for IngestError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Worker {
            message: err.to_string(),
        }
    }
}

/// Result of a committed load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    /// Table the rows went into.
    pub table_name: String,
    /// Rows committed.
    pub inserted_rows: u64,
    /// Malformed rows skipped (always 0 in strict mode).
    pub reject_count: u64,
}

/// Unpacks archives.
#[async_trait]
pub trait ArchiveExtractor: Send + Sync {
    /// Replaces the contents of `dest_dir` with the archive's entries and
    /// returns the top-level `.csv` files, sorted by name.
    async fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, IngestError>;
}

/// Loads one delimited file into the analytical store.
#[async_trait]
pub trait TableLoader: Send + Sync {
    /// Loads `path`, replacing any previous load of the same file.
    ///
    /// In strict mode any malformed row fails the whole file with
    /// [`IngestError::MalformedRows`] and nothing is committed.
    async fn load(&self, path: &Path, strict: bool) -> Result<LoadOutcome, IngestError>;
}
