//! Update feed resolver.
//!
//! Fetches the release feed document for this build's channel and platform
//! and reduces it to "no update" or an [`UpdateInfo`].
//!
//! The feed is an electron-builder style YAML document:
//!
//! ```yaml
//! version: 2.0.0
//! files:
//!   - url: app-mac-arm64-2.0.0.zip
//!     sha512: ...
//!     size: 123456
//! path: app-mac-2.0.0.zip
//! vendor:
//!   requireManualUpdate: 'false'
//!   minOSVersion: '20.1.0'
//! ```
//!
//! Keys the pipeline does not use (`sha512`, `releaseDate`, ...) are ignored.

use std::sync::Arc;

use async_trait::async_trait;
use semver::Version;
use serde::Deserialize;
use serde_yaml::Value;
use tracing::{info, warn};

use crate::download::Downloader;
use crate::error::UpdateError;
use crate::platform::{parse_os_release, Platform};

/// Result of a successful poll that found a newer release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    /// Artifact file name, relative to the updates base URL
    pub file_name: String,
    /// Release version
    pub version: Version,
    /// Advertised artifact size in bytes (zero if unknown)
    pub size: u64,
}

/// Source of update information.
#[async_trait]
pub trait UpdateFeed: Send + Sync {
    /// Poll once. `Ok(None)` means there is nothing newer than the running build.
    async fn check(&self) -> Result<Option<UpdateInfo>, UpdateError>;
}

/// One artifact entry in the feed.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedFile {
    pub url: String,
    #[serde(default)]
    pub size: Option<Value>,
}

/// Vendor extension block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedVendor {
    #[serde(default)]
    pub require_manual_update: Option<Value>,
    #[serde(default, rename = "minOSVersion")]
    pub min_os_version: Option<Value>,
}

impl FeedVendor {
    pub fn requires_manual_update(&self) -> bool {
        self.require_manual_update
            .as_ref()
            .and_then(scalar_string)
            .is_some_and(|v| v == "true")
    }

    /// Oldest OS release the update supports, if the feed names one.
    pub fn min_os_version(&self) -> Option<Version> {
        let raw = self.min_os_version.as_ref().and_then(scalar_string)?;
        let parsed = parse_os_release(&raw);
        if parsed.is_none() {
            warn!("checkForUpdates: ignoring unparseable minOSVersion '{}'", raw);
        }
        parsed
    }
}

/// Parsed feed document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedDocument {
    pub version: Value,
    #[serde(default)]
    pub files: Vec<FeedFile>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub vendor: Option<FeedVendor>,
}

impl FeedDocument {
    /// Parse a feed document. Scalars are accepted quoted or bare.
    pub fn parse(yaml: &str) -> Result<Self, UpdateError> {
        if yaml.trim().is_empty() {
            return Err(UpdateError::InvalidFeed("empty feed document".to_string()));
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn version(&self) -> Result<Version, UpdateError> {
        let raw = scalar_string(&self.version)
            .ok_or_else(|| UpdateError::InvalidFeed("feed has no version".to_string()))?;
        Ok(Version::parse(raw.trim())?)
    }

    /// Advertised size of `file_name`, zero if absent.
    pub fn size_of(&self, file_name: &str) -> u64 {
        self.files
            .iter()
            .find(|f| f.url == file_name)
            .and_then(|f| f.size.as_ref())
            .and_then(scalar_string)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    /// Pick the artifact for `platform`/`arch`.
    ///
    /// On macOS and Windows the single file entry that mentions the arch and
    /// carries the platform's extension wins; otherwise `path` is used.
    pub fn select_file_name(&self, platform: Platform, arch: &str) -> Result<String, UpdateError> {
        let mut selected = None;

        if let Some(extension) = platform.artifact_extension() {
            let candidates: Vec<&FeedFile> = self
                .files
                .iter()
                .filter(|f| f.url.contains(arch) && f.url.ends_with(extension))
                .collect();
            if candidates.len() == 1 {
                selected = Some(candidates[0].url.clone());
            }
        }

        let file_name = match selected.or_else(|| self.path.clone()) {
            Some(name) => name,
            None => {
                return Err(UpdateError::InvalidFeed(
                    "no path present in feed".to_string(),
                ))
            }
        };

        if !is_update_file_name_valid(&file_name) {
            return Err(UpdateError::InvalidFeed(format!(
                "path '{}' contains invalid characters",
                file_name
            )));
        }

        Ok(file_name)
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Artifact names are restricted to `[A-Za-z0-9.-]+`, so a feed can never
/// point a download outside the cache directory.
pub fn is_update_file_name_valid(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
}

/// Release channel for a running version, derived from its pre-release tag.
pub fn channel_for_version(version: &Version) -> &'static str {
    let pre = version.pre.as_str();
    if pre.contains("staging") {
        "staging"
    } else if pre.contains("alpha") {
        "alpha"
    } else if pre.contains("beta") {
        "beta"
    } else {
        "latest"
    }
}

/// Feed document file name: `<channel>-mac.yml` on macOS, `<channel>.yml` elsewhere.
pub fn feed_file_name(channel: &str, platform: Platform) -> String {
    match platform {
        Platform::MacOs => format!("{}-mac.yml", channel),
        _ => format!("{}.yml", channel),
    }
}

/// Feed served over HTTP from the configured updates base URL.
pub struct HttpFeed {
    downloader: Arc<Downloader>,
    base_url: String,
    current_version: Version,
    platform: Platform,
    arch: String,
    os_release: Option<Version>,
}

impl HttpFeed {
    pub fn new(
        downloader: Arc<Downloader>,
        base_url: impl Into<String>,
        current_version: Version,
        platform: Platform,
        arch: impl Into<String>,
    ) -> Self {
        Self {
            downloader,
            base_url: base_url.into(),
            current_version,
            platform,
            arch: arch.into(),
            os_release: None,
        }
    }

    /// Release of the running OS, checked against the feed's `minOSVersion`.
    /// Without it the check is skipped.
    pub fn with_os_release(mut self, os_release: Option<Version>) -> Self {
        self.os_release = os_release;
        self
    }

    /// Full URL of the feed document for this build.
    pub fn check_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            feed_file_name(channel_for_version(&self.current_version), self.platform)
        )
    }
}

#[async_trait]
impl UpdateFeed for HttpFeed {
    async fn check(&self) -> Result<Option<UpdateInfo>, UpdateError> {
        let body = self.downloader.fetch_text(&self.check_url()).await?;
        let document = FeedDocument::parse(&body)?;

        if let Some(vendor) = &document.vendor {
            if vendor.requires_manual_update() {
                warn!("checkForUpdates: manual update required");
                return Err(UpdateError::ManualUpdateRequired);
            }

            if let (Some(required), Some(current)) = (vendor.min_os_version(), &self.os_release) {
                if *current < required {
                    warn!(
                        "checkForUpdates: OS version {} is less than the minimum supported version {}",
                        current, required
                    );
                    return Err(UpdateError::UnsupportedOs {
                        current: current.to_string(),
                        required: required.to_string(),
                    });
                }
            }
        }

        let version = document.version()?;
        if version <= self.current_version {
            info!(
                "checkForUpdates: {} is not newer than {}; no new update available",
                version, self.current_version
            );
            return Ok(None);
        }

        let file_name = document.select_file_name(self.platform, &self.arch)?;
        let size = document.size_of(&file_name);
        info!(
            version = %version,
            file_name = %file_name,
            "checkForUpdates: found newer version"
        );

        Ok(Some(UpdateInfo {
            file_name,
            version,
            size,
        }))
    }
}
