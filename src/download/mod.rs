//! Transfer layer: streaming HTTP downloads and retry policy.
//!
//! - [`Transfer`] - the seam the sync engine fetches through
//! - [`HttpClient`] - reqwest implementation streaming bodies to disk
//! - [`RetryPolicy`] / [`classify_error`] - caller-level retry decisions

mod client;
mod constants;
mod error;
mod retry;

use std::path::Path;

use async_trait::async_trait;

pub use client::HttpClient;
pub use constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
pub use error::DownloadError;
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};

// Note: no module-local Result alias. Use `Result<T, DownloadError>` explicitly.

/// Moves bytes from a URL to local storage.
///
/// Implementations never retry; a non-success response is an error.
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Streams the object at `url` into `dest` (created or truncated) and
    /// returns the byte count. A failed call leaves no file at `dest`.
    async fn fetch_to(&self, url: &str, dest: &Path) -> Result<u64, DownloadError>;

    /// Fetches a small text document (listing pages).
    async fn fetch_text(&self, url: &str) -> Result<String, DownloadError>;
}
