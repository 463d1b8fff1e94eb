//! Single-slot download cache.
//!
//! Holds at most one downloaded artifact plus its `.sig` file under
//! `<userData>/update-cache`. Downloads land in a per-attempt scratch
//! directory first and are only renamed into the cache once both files are
//! complete, so a partial download is never mistaken for the cached artifact.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use semver::Version;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::download::Downloader;
use crate::error::UpdateError;
use crate::feed::UpdateInfo;
use crate::signature::{signature_file_name, signature_path};

/// An artifact and its signature, fully downloaded into the cache directory.
///
/// Not yet verified; see [`crate::verify::verify_download`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDownload {
    file_path: PathBuf,
    file_name: String,
    version: Version,
}

impl CachedDownload {
    pub(crate) fn new(file_path: PathBuf, file_name: String, version: Version) -> Self {
        Self {
            file_path,
            file_name,
            version,
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn signature_path(&self) -> PathBuf {
        signature_path(&self.file_path)
    }
}

/// Cache invalidation rule: a different file name or a strictly newer
/// version replaces the cached artifact; anything else reuses it.
pub fn needs_download(cached: Option<&CachedDownload>, info: &UpdateInfo) -> bool {
    match cached {
        None => true,
        Some(cached) => cached.file_name != info.file_name || info.version > cached.version,
    }
}

/// Ensure `path` stays within `base` (lexically; no `..` escapes).
pub fn validate_path(base: &Path, path: &Path) -> Result<(), UpdateError> {
    let inside = path
        .strip_prefix(base)
        .map(|rest| {
            rest.components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        })
        .unwrap_or(false);

    if inside {
        Ok(())
    } else {
        Err(UpdateError::PathOutsideBase {
            path: path.display().to_string(),
            base: base.display().to_string(),
        })
    }
}

/// Download manager owning the on-disk cache slot.
///
/// The slot lock is only held to read or replace the cached entry, never
/// across network I/O, so clearing the cache does not wait for a download.
pub struct UpdateCache {
    downloader: Arc<Downloader>,
    base_url: String,
    cache_dir: PathBuf,
    temp_dir: PathBuf,
    current: Mutex<Option<CachedDownload>>,
}

impl UpdateCache {
    pub fn new(
        downloader: Arc<Downloader>,
        base_url: impl Into<String>,
        cache_dir: PathBuf,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            downloader,
            base_url: base_url.into(),
            cache_dir,
            temp_dir,
            current: Mutex::new(None),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The cached artifact, if any.
    pub async fn current(&self) -> Option<CachedDownload> {
        self.current.lock().await.clone()
    }

    /// Whether `info` requires a fresh download. A cached file that has
    /// disappeared from disk always does.
    pub async fn needs_download(&self, info: &UpdateInfo) -> bool {
        let current = self.current.lock().await;
        if let Some(cached) = current.as_ref() {
            if !cached.file_path.exists() {
                return true;
            }
        }
        needs_download(current.as_ref(), info)
    }

    /// Remove scratch directories left behind by interrupted downloads.
    pub async fn remove_stale_temp(&self) {
        remove_dir_logged(&self.temp_dir, "deleteTempFiles: failed to remove temp dir").await;
    }

    /// Return the cached artifact for `info`, downloading it if needed.
    ///
    /// A fresh download first empties the cache directory, including files
    /// left by earlier sessions.
    pub async fn ensure(&self, info: &UpdateInfo) -> Result<CachedDownload, UpdateError> {
        if !self.needs_download(info).await {
            if let Some(cached) = self.current().await {
                info!(
                    version = %cached.version,
                    file_name = %cached.file_name,
                    "downloadUpdate: reusing cached download"
                );
                return Ok(cached);
            }
        }

        if let Some(old) = self.current.lock().await.take() {
            info!(
                version = %old.version,
                file_name = %old.file_name,
                "downloadUpdate: removing superseded download"
            );
        }
        remove_dir_logged(&self.cache_dir, "downloadUpdate: failed to delete old cache").await;

        let scratch = self.temp_dir.join(Uuid::new_v4().to_string());
        let result = self.download_into(&scratch, info).await;
        remove_dir_logged(&scratch, "downloadUpdate: failed to remove temp dir").await;

        let cached = result?;
        *self.current.lock().await = Some(cached.clone());
        Ok(cached)
    }

    async fn download_into(
        &self,
        scratch: &Path,
        info: &UpdateInfo,
    ) -> Result<CachedDownload, UpdateError> {
        let sig_name = signature_file_name(&info.file_name);

        let temp_artifact = scratch.join(&info.file_name);
        let temp_sig = scratch.join(&sig_name);
        let final_artifact = self.cache_dir.join(&info.file_name);
        let final_sig = self.cache_dir.join(&sig_name);

        validate_path(&self.temp_dir, &temp_artifact)?;
        validate_path(&self.temp_dir, &temp_sig)?;
        validate_path(&self.cache_dir, &final_artifact)?;
        validate_path(&self.cache_dir, &final_sig)?;

        tokio::fs::create_dir_all(scratch).await?;

        let sig_url = self.url_for(&sig_name);
        info!("downloadUpdate: downloading signature {}", sig_url);
        let signature = self.downloader.fetch_text(&sig_url).await?;
        tokio::fs::write(&temp_sig, signature.as_bytes()).await?;

        let artifact_url = self.url_for(&info.file_name);
        info!("downloadUpdate: downloading {}", artifact_url);
        let written = self
            .downloader
            .download_to_file(&artifact_url, &temp_artifact, info.size)
            .await?;

        debug!(
            from = %temp_artifact.display(),
            to = %final_artifact.display(),
            "downloadUpdate: moving into cache"
        );
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        tokio::fs::rename(&temp_sig, &final_sig).await?;
        tokio::fs::rename(&temp_artifact, &final_artifact).await?;

        info!(
            version = %info.version,
            file_name = %info.file_name,
            bytes = written,
            "downloadUpdate: download complete"
        );

        Ok(CachedDownload::new(
            final_artifact,
            info.file_name.clone(),
            info.version.clone(),
        ))
    }

    /// Remove the whole cache directory. Does not wait for a download in
    /// flight; its scratch files never count as cached.
    pub async fn clear(&self) -> Result<(), UpdateError> {
        *self.current.lock().await = None;
        match tokio::fs::remove_dir_all(&self.cache_dir).await {
            Ok(()) => {
                info!(path = %self.cache_dir.display(), "deleteCache: removed cache directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn url_for(&self, file_name: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), file_name)
    }
}

/// Best-effort recursive delete; failures are logged, never raised.
async fn remove_dir_logged(path: &Path, context: &str) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "{}: {}", context, e);
        }
    }
}
