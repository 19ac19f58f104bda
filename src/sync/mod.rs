//! Incremental sync pipeline.
//!
//! One run flows through these stages, leaf first:
//!
//! 1. [`WorkSetPolicy`] / [`diff`]: decide which listed objects need work
//! 2. [`Fetcher`]: trust the local copy or stage a fresh download
//! 3. [`IntegrityGuard`]: classify the staged bytes; archive the live file
//!    through [`RollbackArchiver`] before a suspicious overwrite
//! 4. commit, extract, load, record
//!
//! [`SyncEngine`] wires the stages onto a bounded worker pool.
//! [`Deduplicator`] and [`Verifier`] run outside of a sync.

mod dedup;
mod diff;
mod engine;
mod fetcher;
mod integrity;
mod rollback;
mod verify;

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

pub use dedup::{Deduplicator, ReconcileReport, RetentionPolicy};
pub use diff::{WorkSetPolicy, date_token, diff};
pub use engine::{RunOptions, SyncEngine, SyncReport};
pub use fetcher::{FetchFailure, Fetcher, Staged, StagedFile, TrustedCopy};
pub use integrity::{ContentChangePolicy, Inspection, IntegrityGuard, IntegrityPolicy, Verdict};
pub use rollback::{RestoreOutcome, RollbackArchiver};
pub use verify::{Mismatch, VerifyReport, Verifier};

use crate::download::DownloadError;
use crate::ingest::IngestError;
use crate::lock::LockError;
use crate::remote::ListingError;
use crate::store::StoreError;

/// Errors from sync, dedup, rollback and verify operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A fetch failed after its retries.
    #[error("fetch of {file_name} failed: {source}")]
    NetworkFailure {
        /// Object name.
        file_name: String,
        /// Last transfer error.
        #[source]
        source: DownloadError,
    },

    /// The archive could not be unpacked.
    #[error("corrupt archive {file_name}: {message}")]
    CorruptArchive {
        /// Object name.
        file_name: String,
        /// Reader error text.
        message: String,
    },

    /// Strict ingestion rejected a file.
    #[error("{reject_count} malformed row(s) in {file_name}, load rolled back")]
    MalformedRows {
        /// Delimited file name.
        file_name: String,
        /// Malformed rows found.
        reject_count: u64,
    },

    /// A replacement looked wrong; the previous bytes were archived.
    #[error("suspicious replacement of {file_name}: {reason}")]
    SuspiciousReplacement {
        /// Object name.
        file_name: String,
        /// Classification reason.
        reason: String,
    },

    /// A rollback record points at a backup that no longer exists.
    #[error("backup for rollback {rollback_id} is missing at {path}")]
    BackupMissing {
        /// Rollback record id.
        rollback_id: String,
        /// Recorded backup path.
        path: PathBuf,
    },

    /// A duplicate could not be retired.
    #[error("failed to retire duplicate {file_name}: {message}")]
    RemovalFailure {
        /// Duplicate file name.
        file_name: String,
        /// What went wrong.
        message: String,
    },

    /// Metadata or log store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Remote listing failure.
    #[error("remote listing failed: {0}")]
    Listing(#[from] ListingError),

    /// Local filesystem failure.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Another sync or dedup run holds the run lock.
    #[error("run lock {path} is held by another sync or dedup run")]
    LockHeld {
        /// Lock file path.
        path: PathBuf,
    },

    /// A listed object name is not safe to use as a local file name.
    #[error("refusing unsafe object name {name:?}")]
    UnsafeName {
        /// Offending name.
        name: String,
    },

    /// No rollback record with this id.
    #[error("no rollback record {rollback_id}")]
    RollbackNotFound {
        /// Requested id.
        rollback_id: String,
    },

    /// Restore target has no metadata row.
    #[error("no metadata for {file_name}; restore refused")]
    MetadataMissing {
        /// File name.
        file_name: String,
    },

    /// Archival before an overwrite failed; nothing was overwritten.
    #[error("failed to archive {file_name}: {message}")]
    Archive {
        /// File name.
        file_name: String,
        /// What went wrong.
        message: String,
    },

    /// Any other ingestion failure.
    #[error("ingestion of {file_name} failed: {source}")]
    Ingest {
        /// Delimited file name.
        file_name: String,
        /// Loader error.
        #[source]
        source: IngestError,
    },
}

impl SyncError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Maps a loader error for `file_name` onto the sync error kinds.
    #[must_use]
    pub fn from_ingest(file_name: &str, error: IngestError) -> Self {
        match error {
            IngestError::CorruptArchive { message, .. } => Self::CorruptArchive {
                file_name: file_name.to_string(),
                message,
            },
            IngestError::MalformedRows { reject_count, .. } => Self::MalformedRows {
                file_name: file_name.to_string(),
                reject_count,
            },
            source => Self::Ingest {
                file_name: file_name.to_string(),
                source,
            },
        }
    }

    /// Issue category for run reports.
    #[must_use]
    pub fn issue_kind(&self) -> IssueKind {
        match self {
            Self::NetworkFailure { .. } => IssueKind::NetworkFailure,
            Self::CorruptArchive { .. } => IssueKind::CorruptArchive,
            Self::MalformedRows { .. } => IssueKind::MalformedRows,
            Self::SuspiciousReplacement { .. } => IssueKind::SuspiciousReplacement,
            Self::UnsafeName { .. } => IssueKind::UnsafeName,
            Self::Archive { .. } | Self::BackupMissing { .. } => IssueKind::Archive,
            Self::Ingest { .. } => IssueKind::IngestFailure,
            Self::Store(_) => IssueKind::Store,
            _ => IssueKind::Io,
        }
    }
}

impl From<LockError> for SyncError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Held { path } => Self::LockHeld { path },
            LockError::Io { path, source } => Self::Io { path, source },
        }
    }
}

/// Category of a per-item problem recorded in a [`SyncReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Fetch failed after retries.
    NetworkFailure,
    /// Archive could not be unpacked.
    CorruptArchive,
    /// Strict ingestion rejected a file.
    MalformedRows,
    /// Replacement flagged and archived.
    SuspiciousReplacement,
    /// Listed name refused.
    UnsafeName,
    /// Archival before overwrite failed.
    Archive,
    /// Other ingestion failure.
    IngestFailure,
    /// Store write failed for the item.
    Store,
    /// Local filesystem failure.
    Io,
}

/// One per-item problem. The run continues past every issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncIssue {
    /// Object or delimited file name.
    pub file_name: String,
    /// Category.
    pub kind: IssueKind,
    /// Human-readable detail.
    pub message: String,
}

impl SyncIssue {
    /// Builds an issue from an error.
    #[must_use]
    pub fn from_error(file_name: &str, error: &SyncError) -> Self {
        Self {
            file_name: file_name.to_string(),
            kind: error.issue_kind(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_ingest_maps_kinds() {
        let corrupt = SyncError::from_ingest(
            "a.zip",
            IngestError::corrupt_archive("/tmp/a.zip", "bad magic"),
        );
        assert_eq!(corrupt.issue_kind(), IssueKind::CorruptArchive);

        let rejected = SyncError::from_ingest(
            "a.csv",
            IngestError::MalformedRows {
                path: PathBuf::from("/tmp/a.csv"),
                table_name: "t_a".to_string(),
                reject_count: 3,
                first_error: "line 2".to_string(),
            },
        );
        assert!(matches!(rejected, SyncError::MalformedRows { reject_count: 3, .. }));

        let other = SyncError::from_ingest(
            "a.csv",
            IngestError::Warehouse {
                message: "disk full".to_string(),
            },
        );
        assert_eq!(other.issue_kind(), IssueKind::IngestFailure);
    }

    #[test]
    fn test_lock_error_conversion() {
        let held: SyncError = LockError::Held {
            path: PathBuf::from("/data/.tripsync.lock"),
        }
        .into();
        assert!(matches!(held, SyncError::LockHeld { .. }));
    }

    #[test]
    fn test_issue_serializes_snake_case_kind() {
        let issue = SyncIssue::from_error(
            "x.zip",
            &SyncError::UnsafeName {
                name: "../x.zip".to_string(),
            },
        );
        let json = serde_json::to_string(&issue).unwrap();
        assert!(json.contains("\"kind\":\"unsafe_name\""));
    }
}
