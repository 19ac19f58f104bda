//! HTTP client wrapper for streaming remote objects to disk.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument};
use url::Url;

use super::Transfer;
use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS, user_agent};
use super::error::DownloadError;

/// HTTP client for listings and object downloads.
///
/// Create once and share; reqwest pools connections internally.
///
/// ```no_run
/// use tripsync_core::download::HttpClient;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new()?;
/// let bytes = client
///     .download_to_path(
///         "https://divvy-tripdata.s3.amazonaws.com/202401-divvy-tripdata.zip",
///         Path::new("data/zip/.202401-divvy-tripdata.zip.part"),
///     )
///     .await?;
/// println!("{bytes} bytes");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    read_timeout: Duration,
}

impl HttpClient {
    /// Creates a client with default timeouts (30s connect, 5min read).
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] if the TLS backend cannot initialize.
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a client with explicit connect and read timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] if the TLS backend cannot initialize.
    #[instrument(level = "debug")]
    pub fn with_timeouts(
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, DownloadError> {
        let read_timeout = Duration::from_secs(read_timeout_secs);
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .read_timeout(read_timeout)
            .gzip(true)
            .user_agent(user_agent())
            .build()
            .map_err(|source| DownloadError::ClientBuild { source })?;
        Ok(Self {
            client,
            read_timeout,
        })
    }

    /// GETs `url` and returns the body as text.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] on invalid URL, network failure, timeout or
    /// non-success status.
    #[instrument(level = "debug", skip(self), fields(url = %url))]
    pub async fn get_text(&self, url: &str) -> Result<String, DownloadError> {
        let response = self.send_get(url).await?;
        response
            .text()
            .await
            .map_err(|e| DownloadError::from_reqwest(url, self.read_timeout, e))
    }

    /// Streams the body of `url` into `dest`, creating or truncating it.
    ///
    /// On any failure after `dest` was created the partial file is removed.
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] on invalid URL, network failure, timeout,
    /// non-success status or a local write failure.
    #[instrument(skip(self, dest), fields(url = %url, dest = %dest.display()))]
    pub async fn download_to_path(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        debug!("starting download");
        let response = self.send_get(url).await?;

        let mut file = File::create(dest)
            .await
            .map_err(|e| DownloadError::io(dest, e))?;

        let result = stream_to_file(&mut file, response, url, dest, self.read_timeout).await;
        drop(file);

        match result {
            Ok(bytes) => {
                info!(bytes, "download complete");
                Ok(bytes)
            }
            Err(error) => {
                debug!(path = %dest.display(), "cleaning up partial file after error");
                let _ = tokio::fs::remove_file(dest).await;
                Err(error)
            }
        }
    }

    async fn send_get(&self, url: &str) -> Result<reqwest::Response, DownloadError> {
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(url, self.read_timeout, e))?;

        if !response.status().is_success() {
            return Err(DownloadError::http_status(url, response.status().as_u16()));
        }
        Ok(response)
    }

    /// Returns the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Transfer for HttpClient {
    async fn fetch_to(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        self.download_to_path(url, dest).await
    }

    async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        self.get_text(url).await
    }
}

async fn stream_to_file(
    file: &mut File,
    response: reqwest::Response,
    url: &str,
    path: &Path,
    read_timeout: Duration,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| DownloadError::from_reqwest(url, read_timeout, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(path, e))?;
        bytes_written += chunk.len() as u64;
    }

    writer.flush().await.map_err(|e| DownloadError::io(path, e))?;
    writer
        .get_mut()
        .sync_all()
        .await
        .map_err(|e| DownloadError::io(path, e))?;

    Ok(bytes_written)
}
