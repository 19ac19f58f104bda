//! Fetch-or-trust decisions and two-phase downloads.
//!
//! [`Fetcher::stage`] either trusts the live copy (its digest matches the
//! expected remote fingerprint) or streams the object into
//! `<download_dir>/.<name>.part`. A staged file becomes live only through
//! [`Fetcher::commit`], which renames it over the live path; until then the
//! live file is untouched.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::download::{DownloadError, Transfer};
use crate::hasher::{FileDigest, FingerprintMatch, digest_file};
use crate::remote::{RemoteListing, is_safe_object_name};
use crate::store::{DownloadEvent, DownloadStatus};

/// A live copy accepted without a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedCopy {
    /// The `skipped` event for this decision.
    pub event: DownloadEvent,
    /// Digest of the live file.
    pub digest: FileDigest,
}

/// Bytes downloaded into the staging path, not yet live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// Object name.
    pub file_name: String,
    /// Remote fingerprint the download was made for.
    pub remote_fingerprint: String,
    /// Where the bytes are now.
    pub staging_path: PathBuf,
    /// Where they go on commit.
    pub live_path: PathBuf,
    /// Digest of the staged bytes.
    pub digest: FileDigest,
}

/// Result of [`Fetcher::stage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staged {
    /// The live copy is consistent with the remote fingerprint.
    Trusted(TrustedCopy),
    /// Fresh bytes are waiting in the staging path.
    Fresh(StagedFile),
}

/// A failed attempt and its `failed` event.
#[derive(Debug)]
pub struct FetchFailure {
    /// Event to append for this attempt.
    pub event: DownloadEvent,
    /// What went wrong.
    pub error: DownloadError,
}

/// Downloads objects into the download directory.
pub struct Fetcher {
    transfer: Arc<dyn Transfer>,
    listing: Arc<dyn RemoteListing>,
    download_dir: PathBuf,
    fetch_timeout: Duration,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("download_dir", &self.download_dir)
            .field("fetch_timeout", &self.fetch_timeout)
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    /// Creates a fetcher resolving object URLs through `listing`.
    #[must_use]
    pub fn new(
        transfer: Arc<dyn Transfer>,
        listing: Arc<dyn RemoteListing>,
        download_dir: PathBuf,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            transfer,
            listing,
            download_dir,
            fetch_timeout,
        }
    }

    /// Live path of `name`.
    #[must_use]
    pub fn live_path(&self, name: &str) -> PathBuf {
        self.download_dir.join(name)
    }

    fn staging_path(&self, name: &str) -> PathBuf {
        self.download_dir.join(format!(".{name}.part"))
    }

    /// Trusts the live copy or stages a fresh download.
    ///
    /// Never retries. The live file is not modified.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchFailure`] carrying a `failed` event when the name is
    /// unsafe, the transfer fails or times out, or the staged file cannot be
    /// digested. No staging file is left behind.
    #[instrument(skip(self), fields(file = %name))]
    pub async fn stage(
        &self,
        name: &str,
        expected_remote_fingerprint: &str,
        force: bool,
    ) -> Result<Staged, FetchFailure> {
        let live_path = self.live_path(name);
        let fail = |error: DownloadError| FetchFailure {
            event: DownloadEvent::failed(name, Some(expected_remote_fingerprint), live_path.clone()),
            error,
        };

        if !is_safe_object_name(name) {
            return Err(fail(DownloadError::invalid_url(name)));
        }

        if !force && let Some(trusted) = self.trust_live_copy(name, expected_remote_fingerprint).await {
            return Ok(Staged::Trusted(trusted));
        }

        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| fail(DownloadError::io(&self.download_dir, e)))?;

        let url = self.listing.object_url(name);
        let staging_path = self.staging_path(name);
        let transfer = self.transfer.fetch_to(&url, &staging_path);
        let result = match tokio::time::timeout(self.fetch_timeout, transfer).await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::timeout(&url, self.fetch_timeout)),
        };
        if let Err(error) = result {
            remove_quietly(&staging_path).await;
            return Err(fail(error));
        }

        let digest = match digest_file(&staging_path).await {
            Ok(digest) => digest,
            Err(error) => {
                remove_quietly(&staging_path).await;
                return Err(fail(DownloadError::io(&staging_path, error)));
            }
        };
        debug!(bytes = digest.size, sha256 = %digest.sha256, "download staged");

        Ok(Staged::Fresh(StagedFile {
            file_name: name.to_string(),
            remote_fingerprint: expected_remote_fingerprint.to_string(),
            staging_path,
            live_path,
            digest,
        }))
    }

    async fn trust_live_copy(&self, name: &str, expected: &str) -> Option<TrustedCopy> {
        let live_path = self.live_path(name);
        if !tokio::fs::try_exists(&live_path).await.unwrap_or(false) {
            return None;
        }
        let digest = match digest_file(&live_path).await {
            Ok(digest) => digest,
            Err(error) => {
                warn!(path = %live_path.display(), %error, "live copy unreadable, refetching");
                return None;
            }
        };
        if digest.compare_remote(expected) != FingerprintMatch::Match {
            return None;
        }

        debug!("live copy matches remote fingerprint, skipping transfer");
        Some(TrustedCopy {
            event: DownloadEvent {
                fetch_id: DownloadEvent::new_fetch_id(),
                file_name: name.to_string(),
                remote_fingerprint: Some(expected.to_string()),
                content_fingerprint: Some(digest.sha256.clone()),
                fetch_time: Utc::now(),
                status: DownloadStatus::Skipped,
                fingerprint_match: Some(true),
                local_path: Some(live_path),
            },
            digest,
        })
    }

    /// Renames a staged file over the live path.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchFailure`] if the rename fails; the staging file is
    /// removed and the live file is untouched.
    #[instrument(skip(self, staged), fields(file = %staged.file_name))]
    pub async fn commit(&self, staged: StagedFile) -> Result<DownloadEvent, FetchFailure> {
        if let Err(error) = tokio::fs::rename(&staged.staging_path, &staged.live_path).await {
            remove_quietly(&staged.staging_path).await;
            return Err(FetchFailure {
                event: DownloadEvent::failed(
                    &staged.file_name,
                    Some(&staged.remote_fingerprint),
                    staged.live_path.clone(),
                ),
                error: DownloadError::io(&staged.live_path, error),
            });
        }

        let fingerprint_match = staged.digest.compare_remote(&staged.remote_fingerprint);
        if fingerprint_match == FingerprintMatch::Mismatch {
            warn!(
                remote = %staged.remote_fingerprint,
                md5 = %staged.digest.md5,
                "downloaded bytes do not match remote fingerprint"
            );
        }

        Ok(DownloadEvent {
            fetch_id: DownloadEvent::new_fetch_id(),
            file_name: staged.file_name,
            remote_fingerprint: Some(staged.remote_fingerprint),
            content_fingerprint: Some(staged.digest.sha256),
            fetch_time: Utc::now(),
            status: DownloadStatus::Downloaded,
            fingerprint_match: fingerprint_match.as_option(),
            local_path: Some(staged.live_path),
        })
    }

    /// Drops a staged file without touching the live path.
    pub async fn discard(&self, staged: &StagedFile) -> DownloadEvent {
        remove_quietly(&staged.staging_path).await;
        DownloadEvent::failed(
            &staged.file_name,
            Some(&staged.remote_fingerprint),
            staged.live_path.clone(),
        )
    }

    /// One-step fetch: stage, then commit.
    ///
    /// Always yields exactly one event; failures are `failed` events.
    pub async fn fetch(&self, name: &str, expected_remote_fingerprint: &str, force: bool) -> DownloadEvent {
        match self.stage(name, expected_remote_fingerprint, force).await {
            Ok(Staged::Trusted(trusted)) => trusted.event,
            Ok(Staged::Fresh(staged)) => match self.commit(staged).await {
                Ok(event) => event,
                Err(failure) => failure.event,
            },
            Err(failure) => {
                warn!(file = %name, error = %failure.error, "fetch failed");
                failure.event
            }
        }
    }
}

async fn remove_quietly(path: &std::path::Path) {
    if let Err(error) = tokio::fs::remove_file(path).await
        && error.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), %error, "failed to remove staging file");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::HttpClient;
    use crate::remote::S3Listing;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(server: &MockServer, dir: &std::path::Path, timeout: Duration) -> Fetcher {
        let transfer: Arc<dyn Transfer> = Arc::new(HttpClient::new().unwrap());
        let listing = Arc::new(S3Listing::new(Arc::clone(&transfer), &server.uri(), ".zip"));
        Fetcher::new(transfer, listing, dir.join("zip"), timeout)
    }

    #[tokio::test]
    async fn test_fetch_downloads_and_matches_md5_etag() {
        let server = MockServer::start().await;
        let body = b"PK zip bytes".to_vec();
        Mock::given(method("GET"))
            .and(path("/202401-trip.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(&server, dir.path(), Duration::from_secs(30));
        let etag = FileDigest::of_bytes(&body).md5;

        let event = fetcher.fetch("202401-trip.zip", &etag, false).await;

        assert_eq!(event.status, DownloadStatus::Downloaded);
        assert_eq!(event.fingerprint_match, Some(true));
        assert_eq!(std::fs::read(fetcher.live_path("202401-trip.zip")).unwrap(), body);
        assert!(!dir.path().join("zip").join(".202401-trip.zip.part").exists());
    }

    #[tokio::test]
    async fn test_matching_live_copy_is_skipped_without_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(&server, dir.path(), Duration::from_secs(30));
        std::fs::create_dir_all(dir.path().join("zip")).unwrap();
        std::fs::write(fetcher.live_path("a.zip"), b"same").unwrap();
        let etag = FileDigest::of_bytes(b"same").md5;

        let first = fetcher.fetch("a.zip", &etag, false).await;
        let second = fetcher.fetch("a.zip", &etag, false).await;

        assert_eq!(first.status, DownloadStatus::Skipped);
        assert_ne!(first.fetch_id, second.fetch_id);
    }

    #[tokio::test]
    async fn test_force_refetches_matching_copy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"same".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(&server, dir.path(), Duration::from_secs(30));
        std::fs::create_dir_all(dir.path().join("zip")).unwrap();
        std::fs::write(fetcher.live_path("a.zip"), b"same").unwrap();

        let event = fetcher.fetch("a.zip", &FileDigest::of_bytes(b"same").md5, true).await;
        assert_eq!(event.status, DownloadStatus::Downloaded);
    }

    #[tokio::test]
    async fn test_http_error_is_failed_and_live_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(&server, dir.path(), Duration::from_secs(30));
        std::fs::create_dir_all(dir.path().join("zip")).unwrap();
        std::fs::write(fetcher.live_path("a.zip"), b"old").unwrap();

        let result = fetcher.stage("a.zip", "0123456789abcdef0123456789abcdef", false).await;
        let failure = result.unwrap_err();
        assert_eq!(failure.event.status, DownloadStatus::Failed);
        assert!(matches!(failure.error, DownloadError::HttpStatus { status: 503, .. }));
        assert_eq!(std::fs::read(fetcher.live_path("a.zip")).unwrap(), b"old");
        assert!(!dir.path().join("zip").join(".a.zip.part").exists());
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"slow".to_vec())
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(&server, dir.path(), Duration::from_millis(200));

        let failure = fetcher.stage("a.zip", "etag", false).await.unwrap_err();
        assert!(matches!(failure.error, DownloadError::Timeout { .. }));
        assert!(!dir.path().join("zip").join(".a.zip.part").exists());
    }

    #[tokio::test]
    async fn test_multipart_etag_is_unknown_match() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(&server, dir.path(), Duration::from_secs(30));

        let event = fetcher
            .fetch("a.zip", "0123456789abcdef0123456789abcdef-12", false)
            .await;
        assert_eq!(event.status, DownloadStatus::Downloaded);
        assert_eq!(event.fingerprint_match, None);
    }

    #[tokio::test]
    async fn test_unsafe_name_is_refused() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(&server, dir.path(), Duration::from_secs(30));

        let failure = fetcher.stage("../escape.zip", "etag", false).await.unwrap_err();
        assert!(matches!(failure.error, DownloadError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_discard_keeps_live_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"new".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(&server, dir.path(), Duration::from_secs(30));
        std::fs::create_dir_all(dir.path().join("zip")).unwrap();
        std::fs::write(fetcher.live_path("a.zip"), b"old").unwrap();

        let Staged::Fresh(staged) = fetcher.stage("a.zip", "etag", false).await.unwrap() else {
            panic!("expected a staged download");
        };
        let event = fetcher.discard(&staged).await;

        assert_eq!(event.status, DownloadStatus::Failed);
        assert!(!staged.staging_path.exists());
        assert_eq!(std::fs::read(&staged.live_path).unwrap(), b"old");
    }
}
