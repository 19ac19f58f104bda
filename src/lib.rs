//! tripsync core library
//!
//! Keeps a local mirror of a published bucket of trip data archives in step
//! with the remote, verifies every replacement, and loads the delimited
//! files inside each archive into a local warehouse.
//!
//! # Architecture
//!
//! - [`config`] - `SyncConfig` from TOML plus environment overrides
//! - [`db`] - SQLite pool and schema migrations
//! - [`store`] - metadata and append-only audit logs
//! - [`remote`] - bucket inventory (S3 `ListObjectsV2`)
//! - [`download`] - streaming transfer and retry policy
//! - [`hasher`] - content fingerprints and ETag comparison
//! - [`ingest`] - archive extraction and warehouse loads
//! - [`lock`] - advisory run lock
//! - [`sync`] - diff, fetch, integrity, rollback, dedup and the run engine

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod download;
pub mod hasher;
pub mod ingest;
pub mod lock;
pub mod remote;
pub mod store;
pub mod sync;

// Re-export commonly used types
pub use config::{ConfigError, SyncConfig, SyncPaths};
pub use db::{Database, DatabaseOptions};
pub use download::{
    DEFAULT_MAX_RETRIES, DownloadError, FailureType, HttpClient, RetryDecision, RetryPolicy,
    Transfer, classify_error,
};
pub use hasher::FileDigest;
pub use ingest::{ArchiveExtractor, IngestError, SqliteTableLoader, TableLoader, ZipExtractor};
pub use lock::{LockError, RunLock};
pub use remote::{ListingError, RemoteListing, RemoteObjectRecord, S3Listing};
pub use store::{
    DownloadEvent, DownloadStatus, DuplicateRecord, FileMetadataRecord, IngestionLogEntry,
    IngestionStatus, RollbackRecord, Store, StoreError,
};
pub use sync::{
    ContentChangePolicy, Deduplicator, IntegrityGuard, IntegrityPolicy, ReconcileReport,
    RetentionPolicy, RollbackArchiver, RunOptions, SyncEngine, SyncError, SyncIssue, SyncReport,
    Verifier, VerifyReport,
};
