//! Error types for the update pipeline.

use thiserror::Error;

/// Message fragment the macOS updater reports when the app runs from a
/// read-only volume (e.g. straight out of a mounted disk image).
pub const READ_ONLY_VOLUME_MESSAGE: &str = "Cannot update while running on a read-only volume";

/// Errors that can occur during update operations.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Feed document could not be interpreted
    #[error("invalid feed: {0}")]
    InvalidFeed(String),

    /// Feed flagged the release as requiring a manual update
    #[error("feed requires a manual update")]
    ManualUpdateRequired,

    /// Download failed with HTTP status
    #[error("download failed with status {status}")]
    DownloadFailed { status: u16 },

    /// Network error while streaming a body
    #[error("network error: {0}")]
    NetworkError(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Downloaded artifact did not pass signature verification
    #[error("downloaded update did not pass signature verification (version: '{version}'; fileName: '{file_name}')")]
    SignatureInvalid { version: String, file_name: String },

    /// Signature file could not be decoded
    #[error("malformed signature file: {0}")]
    MalformedSignature(String),

    /// Running OS is older than the release's minimum
    #[error("OS version {current} is less than the minimum supported version {required}")]
    UnsupportedOs { current: String, required: String },

    /// Loopback relay served a token that differs from the generated one
    #[error("relay token mismatch")]
    TokenMismatch,

    /// Loopback relay self-check did not complete in time
    #[error("relay self-check timed out")]
    SelfCheckTimeout,

    /// Loopback relay failed to start or stopped unexpectedly
    #[error("relay server error: {0}")]
    RelayServer(String),

    /// OS-level updater reported an error
    #[error("native updater error: {0}")]
    NativeUpdater(String),

    /// App is running from a read-only volume and cannot replace itself
    #[error("{}", READ_ONLY_VOLUME_MESSAGE)]
    ReadOnlyVolume,

    /// Installer process could not be started
    #[error("failed to spawn installer: {0}")]
    SpawnFailed(String),

    /// Path escaped its base directory
    #[error("path {path} is not under base path {base}")]
    PathOutsideBase { path: String, base: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Version parsing error
    #[error("version parse error: {0}")]
    VersionParseError(String),

    /// YAML parsing error
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl UpdateError {
    /// Feed and download failures that are retried silently on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UpdateError::InvalidFeed(_)
                | UpdateError::DownloadFailed { .. }
                | UpdateError::NetworkError(_)
                | UpdateError::HttpError(_)
                | UpdateError::MalformedSignature(_)
                | UpdateError::YamlError(_)
                | UpdateError::VersionParseError(_)
                | UpdateError::PathOutsideBase { .. }
                | UpdateError::IoError(_)
        )
    }

    /// Classify an error message coming back from the OS updater.
    pub fn from_native_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.contains(READ_ONLY_VOLUME_MESSAGE) {
            UpdateError::ReadOnlyVolume
        } else {
            UpdateError::NativeUpdater(message)
        }
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        UpdateError::HttpError(err.to_string())
    }
}

impl From<semver::Error> for UpdateError {
    fn from(err: semver::Error) -> Self {
        UpdateError::VersionParseError(err.to_string())
    }
}

impl From<skiff_crypto::CryptoError> for UpdateError {
    fn from(err: skiff_crypto::CryptoError) -> Self {
        UpdateError::MalformedSignature(err.to_string())
    }
}
