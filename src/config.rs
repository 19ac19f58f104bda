//! Run configuration.
//!
//! [`SyncConfig`] is an explicit value object: it is loaded once (TOML file,
//! then environment overrides), validated, and handed to each component at
//! construction. Nothing in the crate reads configuration from globals.
//!
//! ```toml
//! bucket = "divvy-tripdata"
//! data_dir = "/var/lib/tripsync"
//! concurrency = 4
//! strict_ingest = true
//! retention = "newest"
//!
//! [integrity]
//! shrink_tolerance_bytes = 0
//! content_change = "unexpected"
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::db::{DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_MAX_CONNECTIONS, DatabaseOptions};
use crate::download::{CONNECT_TIMEOUT_SECS, DEFAULT_MAX_RETRIES, READ_TIMEOUT_SECS, RetryPolicy};
use crate::sync::{IntegrityPolicy, RetentionPolicy};

/// Default public bucket.
pub const DEFAULT_BUCKET: &str = "divvy-tripdata";

/// Only keys with this suffix are synchronized by default.
pub const DEFAULT_OBJECT_SUFFIX: &str = ".zip";

/// Default number of items processed concurrently.
pub const DEFAULT_SYNC_CONCURRENCY: usize = 4;

/// Upper bound on one whole fetch, including streaming the body.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 900;

const MAX_SYNC_CONCURRENCY: usize = 32;
const MAX_TIMEOUT_SECS: u64 = 3600;

/// Environment variable overriding [`SyncConfig::bucket`].
pub const ENV_BUCKET: &str = "TRIPSYNC_BUCKET";
/// Environment variable overriding [`SyncConfig::endpoint`].
pub const ENV_ENDPOINT: &str = "TRIPSYNC_ENDPOINT";
/// Environment variable overriding [`SyncConfig::data_dir`].
pub const ENV_DATA_DIR: &str = "TRIPSYNC_DATA_DIR";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Config file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema.
    #[error("failed to parse config {origin}: {source}")]
    Parse {
        /// File path or `<inline>`.
        origin: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A value is outside its accepted range.
    #[error("invalid config value for `{field}`: {message}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

/// Complete configuration for sync, dedup and restore operations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Bucket name.
    pub bucket: String,
    /// Base URL of the bucket; defaults to the virtual-hosted S3 URL.
    pub endpoint: Option<String>,
    /// Key suffix filter applied to the listing.
    pub object_suffix: String,
    /// Root for every path not configured explicitly.
    pub data_dir: PathBuf,
    /// Live archive files. Default `<data_dir>/zip`.
    pub download_dir: Option<PathBuf>,
    /// Extracted files. Default `<data_dir>/csv`.
    pub extract_dir: Option<PathBuf>,
    /// Rollback backups. Default `<data_dir>/rollback`.
    pub rollback_dir: Option<PathBuf>,
    /// Metadata and log database. Default `<data_dir>/tripsync-log.db`.
    pub log_db_path: Option<PathBuf>,
    /// Analytical store. Default `<data_dir>/warehouse.db`.
    pub warehouse_db_path: Option<PathBuf>,
    /// Items fetched in parallel (1..=32).
    pub concurrency: usize,
    /// Attempts per item including the first.
    pub max_retries: u32,
    /// HTTP connect timeout.
    pub connect_timeout_secs: u64,
    /// HTTP read timeout.
    pub read_timeout_secs: u64,
    /// Overall per-fetch timeout.
    pub fetch_timeout_secs: u64,
    /// Log database pool size (1..=20).
    pub db_max_connections: u32,
    /// Log database busy timeout.
    pub db_busy_timeout_ms: u32,
    /// Reject files with malformed rows instead of skipping the rows.
    pub strict_ingest: bool,
    /// Default survivor choice for deduplication.
    pub retention: RetentionPolicy,
    /// Suspicious-replacement thresholds.
    pub integrity: IntegrityPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            endpoint: None,
            object_suffix: DEFAULT_OBJECT_SUFFIX.to_string(),
            data_dir: PathBuf::from("data"),
            download_dir: None,
            extract_dir: None,
            rollback_dir: None,
            log_db_path: None,
            warehouse_db_path: None,
            concurrency: DEFAULT_SYNC_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            db_max_connections: DEFAULT_MAX_CONNECTIONS,
            db_busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            strict_ingest: false,
            retention: RetentionPolicy::default(),
            integrity: IntegrityPolicy::default(),
        }
    }
}

/// Resolved filesystem layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPaths {
    /// Live archive files.
    pub download_dir: PathBuf,
    /// Extracted files, one subdirectory per archive.
    pub extract_dir: PathBuf,
    /// Rollback backups, one subdirectory per file name.
    pub rollback_dir: PathBuf,
    /// Metadata and log database.
    pub log_db: PathBuf,
    /// Analytical store.
    pub warehouse_db: PathBuf,
    /// Advisory lock shared by sync runs and deduplication.
    pub lock_file: PathBuf,
}

impl SyncPaths {
    /// Lays every path out under `root` using the default names.
    #[must_use]
    pub fn under(root: &Path) -> Self {
        Self {
            download_dir: root.join("zip"),
            extract_dir: root.join("csv"),
            rollback_dir: root.join("rollback"),
            log_db: root.join("tripsync-log.db"),
            warehouse_db: root.join("warehouse.db"),
            lock_file: root.join(".tripsync.lock"),
        }
    }

    /// Live path of a validated object name.
    #[must_use]
    pub fn live_path(&self, name: &str) -> PathBuf {
        self.download_dir.join(name)
    }

    /// Staging path used while a download is in flight.
    #[must_use]
    pub fn staging_path(&self, name: &str) -> PathBuf {
        self.download_dir.join(format!(".{name}.part"))
    }

    /// Extraction directory for an archive (`<extract_dir>/<stem>`).
    #[must_use]
    pub fn extract_dir_for(&self, name: &str) -> PathBuf {
        let stem = Path::new(name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(name);
        self.extract_dir.join(stem)
    }
}

impl SyncConfig {
    /// Loads configuration from an optional TOML file, then applies
    /// environment overrides and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if an explicit file cannot be read,
    /// [`ConfigError::Parse`] on malformed TOML, or [`ConfigError::Invalid`]
    /// on out-of-range values.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::parse(&raw, &path.display().to_string())?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        debug!(bucket = %config.bucket, data_dir = %config.data_dir.display(), "configuration loaded");
        Ok(config)
    }

    /// Parses and validates a TOML document without consulting the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config = Self::parse(raw, "<inline>")?;
        config.validate()?;
        Ok(config)
    }

    fn parse(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            origin: origin.to_string(),
            source,
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Some(bucket) = env_non_empty(ENV_BUCKET) {
            self.bucket = bucket;
        }
        if let Some(endpoint) = env_non_empty(ENV_ENDPOINT) {
            self.endpoint = Some(endpoint);
        }
        if let Some(data_dir) = env_non_empty(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(data_dir);
        }
    }

    /// Validates ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket.trim().is_empty() && self.endpoint.is_none() {
            return Err(invalid("bucket", "must not be empty when no endpoint is set"));
        }
        if !(1..=MAX_SYNC_CONCURRENCY).contains(&self.concurrency) {
            return Err(invalid(
                "concurrency",
                format!("{} not in 1..={MAX_SYNC_CONCURRENCY}", self.concurrency),
            ));
        }
        if !(1..=10).contains(&self.max_retries) {
            return Err(invalid("max_retries", format!("{} not in 1..=10", self.max_retries)));
        }
        for (field, value) in [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("read_timeout_secs", self.read_timeout_secs),
            ("fetch_timeout_secs", self.fetch_timeout_secs),
        ] {
            if !(1..=MAX_TIMEOUT_SECS).contains(&value) {
                return Err(invalid(field, format!("{value} not in 1..={MAX_TIMEOUT_SECS}")));
            }
        }
        if !(1..=20).contains(&self.db_max_connections) {
            return Err(invalid(
                "db_max_connections",
                format!("{} not in 1..=20", self.db_max_connections),
            ));
        }
        if self.db_busy_timeout_ms > 120_000 {
            return Err(invalid(
                "db_busy_timeout_ms",
                format!("{} not in 0..=120000", self.db_busy_timeout_ms),
            ));
        }
        if let Some(endpoint) = &self.endpoint
            && url::Url::parse(endpoint).is_err()
        {
            return Err(invalid("endpoint", format!("'{endpoint}' is not a URL")));
        }
        Ok(())
    }

    /// Bucket base URL without a trailing slash.
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        self.endpoint.as_deref().map_or_else(
            || format!("https://{}.s3.amazonaws.com", self.bucket),
            |e| e.trim_end_matches('/').to_string(),
        )
    }

    /// Resolved filesystem layout.
    #[must_use]
    pub fn paths(&self) -> SyncPaths {
        let defaults = SyncPaths::under(&self.data_dir);
        SyncPaths {
            download_dir: self.download_dir.clone().unwrap_or(defaults.download_dir),
            extract_dir: self.extract_dir.clone().unwrap_or(defaults.extract_dir),
            rollback_dir: self.rollback_dir.clone().unwrap_or(defaults.rollback_dir),
            log_db: self.log_db_path.clone().unwrap_or(defaults.log_db),
            warehouse_db: self.warehouse_db_path.clone().unwrap_or(defaults.warehouse_db),
            lock_file: defaults.lock_file,
        }
    }

    /// Pool options for the log database.
    #[must_use]
    pub fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            max_connections: self.db_max_connections,
            busy_timeout_ms: self.db_busy_timeout_ms,
        }
    }

    /// Caller-level retry policy for fetches.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(self.max_retries)
    }

    /// Overall per-fetch timeout.
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
