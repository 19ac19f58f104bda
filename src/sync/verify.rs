//! Re-hash local files against recorded content fingerprints.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, instrument, warn};

use super::SyncError;
use crate::hasher::content_fingerprint;
use crate::store::Store;

/// A local file whose bytes differ from its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    /// File name.
    pub file_name: String,
    /// Recorded content fingerprint.
    pub expected: String,
    /// Fingerprint of the bytes on disk.
    pub actual: String,
}

/// Outcome of [`Verifier::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Files whose bytes match their metadata.
    pub verified: Vec<String>,
    /// Files with metadata but no local copy.
    pub missing: Vec<String>,
    /// Files whose bytes changed.
    pub mismatched: Vec<Mismatch>,
}

impl VerifyReport {
    /// True when nothing is missing or mismatched.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty()
    }
}

/// Checks every file known to the metadata store.
#[derive(Debug, Clone)]
pub struct Verifier {
    store: Store,
    download_dir: PathBuf,
}

impl Verifier {
    /// Creates a verifier for files under `download_dir`.
    #[must_use]
    pub fn new(store: Store, download_dir: PathBuf) -> Self {
        Self {
            store,
            download_dir,
        }
    }

    /// Re-hashes each metadata row's local file.
    ///
    /// Rows without a recorded content fingerprint only need to exist.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] if metadata cannot be loaded, or
    /// [`SyncError::Io`] if an existing file cannot be read.
    #[instrument(skip(self), fields(dir = %self.download_dir.display()))]
    pub async fn verify(&self) -> Result<VerifyReport, SyncError> {
        let mut report = VerifyReport::default();

        for record in self.store.load_all_metadata().await? {
            let path = self.download_dir.join(&record.file_name);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                warn!(file = %record.file_name, "local copy missing");
                report.missing.push(record.file_name);
                continue;
            }

            let actual = content_fingerprint(&path)
                .await
                .map_err(|e| SyncError::io(&path, e))?;
            match record.content_fingerprint {
                Some(expected) if expected != actual => {
                    warn!(file = %record.file_name, %expected, %actual, "content fingerprint mismatch");
                    report.mismatched.push(Mismatch {
                        file_name: record.file_name,
                        expected,
                        actual,
                    });
                }
                _ => report.verified.push(record.file_name),
            }
        }

        info!(
            verified = report.verified.len(),
            missing = report.missing.len(),
            mismatched = report.mismatched.len(),
            "verification complete"
        );
        Ok(report)
    }
}
