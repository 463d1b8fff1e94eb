//! Configuration for the update pipeline.
//!
//! The three values the host application's configuration store provides
//! (`updates_enabled`, `auto_update`, `updates_public_key`) plus the
//! locations and timings the pipeline needs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skiff_crypto::PublicKey;

use crate::error::UpdateError;

/// Name of the single-slot artifact cache below the user-data directory.
pub const UPDATE_CACHE_DIR: &str = "update-cache";

/// Name of the scratch directory below the user-data directory.
pub const TEMP_DIR: &str = "temp";

/// How the application was packaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Packaging {
    /// Direct download; the app updates itself
    #[default]
    Standard,
    /// Store build; the store owns updates
    AppStore,
}

/// Main updater configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Build-time switch for the whole update pipeline
    #[serde(default = "default_true")]
    pub updates_enabled: bool,

    /// User setting for automatic updates
    #[serde(default = "default_true")]
    pub auto_update: bool,

    /// Hex-encoded Ed25519 public key release signatures are checked against
    #[serde(default)]
    pub updates_public_key: String,

    /// Base URL feed, artifacts and signatures are fetched from
    #[serde(default)]
    pub updates_url: String,

    /// Per-user data directory (holds the update cache and temp files)
    #[serde(default = "default_user_data_dir")]
    pub user_data_dir: PathBuf,

    /// Packaging channel of this build
    #[serde(default)]
    pub packaging: Packaging,

    /// Seconds between feed polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Upper bound for the loopback relay token self-check
    #[serde(default = "default_token_check_timeout")]
    pub token_check_timeout_secs: u64,

    /// How long to wait for the host to acknowledge the read-only volume prompt
    #[serde(default = "default_read_only_ack_timeout")]
    pub read_only_ack_timeout_secs: u64,

    /// Delay after a successful installer spawn before it counts as started
    #[serde(default = "default_spawn_grace")]
    pub spawn_grace_ms: u64,

    /// Elevation helper used when spawning the installer is denied
    #[serde(default)]
    pub elevate_helper: Option<PathBuf>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            updates_enabled: true,
            auto_update: true,
            updates_public_key: String::new(),
            updates_url: String::new(),
            user_data_dir: default_user_data_dir(),
            packaging: Packaging::default(),
            poll_interval_secs: default_poll_interval(),
            token_check_timeout_secs: default_token_check_timeout(),
            read_only_ack_timeout_secs: default_read_only_ack_timeout(),
            spawn_grace_ms: default_spawn_grace(),
            elevate_helper: None,
        }
    }
}

impl UpdaterConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.poll_interval_secs == 0 {
            return Err(UpdateError::ConfigError(
                "poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Parse the configured release public key.
    pub fn public_key(&self) -> Result<PublicKey, UpdateError> {
        if self.updates_public_key.trim().is_empty() {
            return Err(UpdateError::ConfigError(
                "updates_public_key is not set".to_string(),
            ));
        }
        PublicKey::from_hex(&self.updates_public_key)
            .map_err(|e| UpdateError::ConfigError(format!("invalid updates_public_key: {}", e)))
    }

    /// Whether the update loop may run at all for this build and user.
    pub fn auto_update_allowed(&self) -> bool {
        self.packaging != Packaging::AppStore && self.updates_enabled && self.auto_update
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn token_check_timeout(&self) -> Duration {
        Duration::from_secs(self.token_check_timeout_secs)
    }

    pub fn read_only_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.read_only_ack_timeout_secs)
    }

    pub fn spawn_grace(&self) -> Duration {
        Duration::from_millis(self.spawn_grace_ms)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.user_data_dir.join(UPDATE_CACHE_DIR)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.user_data_dir.join(TEMP_DIR)
    }

    /// Elevation helper path, defaulting to `elevate.exe` next to the executable.
    pub fn elevate_helper(&self) -> PathBuf {
        if let Some(path) = &self.elevate_helper {
            return path.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("resources").join("elevate.exe")))
            .unwrap_or_else(|| PathBuf::from("elevate.exe"))
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    30 * 60
}

fn default_token_check_timeout() -> u64 {
    5
}

fn default_read_only_ack_timeout() -> u64 {
    5
}

fn default_spawn_grace() -> u64 {
    200
}

/// Platform-appropriate per-user data directory.
fn default_user_data_dir() -> PathBuf {
    directories::ProjectDirs::from("org", "skiff", "Skiff")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".").join("skiff-data"))
}
