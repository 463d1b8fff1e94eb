//! HTTP transport for feed documents, signatures and artifacts.
//!
//! Small bodies are fetched into memory; artifacts are streamed to disk
//! chunk by chunk so multi-hundred-megabyte installers never sit in memory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::UpdateError;

/// Default connect timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default read timeout for streaming downloads in seconds.
const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;

/// Configuration for the downloader.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Connection timeout in seconds.
    pub timeout_secs: u64,
    /// Read timeout for streaming in seconds.
    pub read_timeout_secs: u64,
    /// User agent string.
    pub user_agent: String,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            user_agent: format!("skiff-updater/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Progress callback type for download progress reporting.
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// HTTP downloader shared by the feed resolver and the cache manager.
pub struct Downloader {
    client: reqwest::Client,
    progress_callback: Option<ProgressCallback>,
}

impl Downloader {
    /// Create a downloader with default timeouts.
    pub fn new() -> Result<Self, UpdateError> {
        Self::with_config(DownloaderConfig::default())
    }

    /// Create a downloader with custom configuration.
    pub fn with_config(config: DownloaderConfig) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self {
            client,
            progress_callback: None,
        })
    }

    /// Set the progress callback.
    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(DownloadProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
    }

    /// Fetch a small text body such as a feed document or a signature.
    pub async fn fetch_text(&self, url: &str) -> Result<String, UpdateError> {
        debug!("Fetching URL: {}", url);

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(UpdateError::DownloadFailed {
                status: response.status().as_u16(),
            });
        }

        let body = response.text().await?;
        debug!("Fetched {} bytes", body.len());
        Ok(body)
    }

    /// Stream `url` into a freshly created file at `dest`.
    ///
    /// `expected_size` is only used for progress reporting; zero means
    /// unknown. Returns the number of bytes written. The file is synced
    /// before returning.
    pub async fn download_to_file(
        &self,
        url: &str,
        dest: &Path,
        expected_size: u64,
    ) -> Result<u64, UpdateError> {
        info!("Starting download: {} -> {:?}", url, dest);

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::DownloadFailed {
                status: status.as_u16(),
            });
        }

        let total = response.content_length().unwrap_or(expected_size);
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;

        self.report_progress(downloaded, total);

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| UpdateError::NetworkError(e.to_string()))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            self.report_progress(downloaded, total);
        }

        file.flush().await?;
        file.sync_all().await?;

        info!("Download complete: {} bytes", downloaded);
        Ok(downloaded)
    }

    fn report_progress(&self, downloaded: u64, total: u64) {
        if let Some(callback) = &self.progress_callback {
            callback(DownloadProgress { downloaded, total });
        }
    }
}

/// Download progress information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Total bytes to download (zero if unknown).
    pub total: u64,
}

impl DownloadProgress {
    /// Download progress as a percentage (0.0 to 100.0).
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.downloaded as f64 / self.total as f64) * 100.0
        }
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.total && self.total > 0
    }
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} bytes ({:.1}%)",
            self.downloaded,
            self.total,
            self.percentage()
        )
    }
}
