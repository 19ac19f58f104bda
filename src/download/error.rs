//! Error types for the transfer layer.
//!
//! Every variant carries the URL or path it concerns; there are no blanket
//! `From<reqwest::Error>` / `From<std::io::Error>` conversions because those
//! sources lack that context. Use the helper constructors instead.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while transferring a remote object.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request or body stream timed out.
    #[error("timeout fetching {url} after {elapsed:?}")]
    Timeout {
        /// The URL that timed out.
        url: String,
        /// Time budget that was exceeded.
        elapsed: Duration,
    },

    /// Non-success HTTP response.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// File system error while writing the body.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {source}")]
    ClientBuild {
        /// The underlying builder error.
        #[source]
        source: reqwest::Error,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            url: url.into(),
            elapsed,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Maps a reqwest error to `Timeout` or `Network`.
    pub(crate) fn from_reqwest(url: &str, budget: Duration, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::timeout(url, budget)
        } else {
            Self::network(url, source)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_timeout_display() {
        let error = DownloadError::timeout("https://bucket/a.zip", Duration::from_secs(5));
        let msg = error.to_string();
        assert!(msg.contains("timeout"));
        assert!(msg.contains("https://bucket/a.zip"));
    }

    #[test]
    fn test_download_error_http_status_display() {
        let error = DownloadError::http_status("https://bucket/a.zip", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(msg.contains("https://bucket/a.zip"), "Expected URL in: {msg}");
    }

    #[test]
    fn test_download_error_io_display() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = DownloadError::io(PathBuf::from("/tmp/.a.zip.part"), io_error);
        assert!(error.to_string().contains("/tmp/.a.zip.part"));
    }

    #[test]
    fn test_download_error_invalid_url_display() {
        let msg = DownloadError::invalid_url("not-a-url").to_string();
        assert!(msg.contains("invalid URL"), "Expected 'invalid URL' in: {msg}");
        assert!(msg.contains("not-a-url"));
    }
}
