//! Remote inventory: what the bucket currently publishes.

mod error;
mod s3;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use error::ListingError;
pub use s3::{ListPage, S3Listing, parse_list_page};

/// One object as listed remotely. Produced fresh on every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteObjectRecord {
    /// Object key; unique within a listing.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// ETag with surrounding quotes stripped.
    pub remote_fingerprint: String,
    /// Remote last-modified time.
    pub last_modified: DateTime<Utc>,
}

/// Source of the remote inventory.
#[async_trait]
pub trait RemoteListing: Send + Sync {
    /// Lists every synchronizable object, in listing order.
    async fn list(&self) -> Result<Vec<RemoteObjectRecord>, ListingError>;

    /// URL the object named `name` can be downloaded from.
    fn object_url(&self, name: &str) -> String;
}

/// Returns true if `name` can be used as a single local file name.
///
/// Rejects empty names, path separators, `.`/`..`, leading dots (reserved
/// for staging files) and control characters.
#[must_use]
pub fn is_safe_object_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\\')
        && !name.chars().any(char::is_control)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_object_names() {
        assert!(is_safe_object_name("202401-divvy-tripdata.zip"));
        assert!(is_safe_object_name("Divvy_Trips_2013.zip"));
    }

    #[test]
    fn test_unsafe_object_names() {
        for name in [
            "",
            ".",
            "..",
            "../etc/passwd",
            "/abs.zip",
            "nested/key.zip",
            "win\\path.zip",
            ".hidden.zip",
            "bad\0name.zip",
        ] {
            assert!(!is_safe_object_name(name), "{name:?} should be unsafe");
        }
    }
}
