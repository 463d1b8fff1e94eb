//! Platform installer handoff.
//!
//! Every entry point that can start an installer takes a
//! [`VerifiedArtifact`] by value.

pub mod macos;
pub mod windows;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::UpdaterConfig;
use crate::error::UpdateError;
use crate::host::HostShell;
use crate::platform::Platform;
use crate::verify::VerifiedArtifact;

pub use macos::{MacRelayHandoff, NativeUpdater, NativeUpdaterEvent, RelayPhase, RelayServer};
pub use windows::{DetachedSpawner, ProcessSpawner, WindowsInstallerHandoff};

/// What the orchestrator does with the cache when the process quits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitPolicy {
    /// Delete the cache directory
    ClearCache,
    /// Verify the cached artifact and hand it to [`InstallerHandoff::on_quit`]
    LastChanceInstall,
}

/// Platform strategy for getting a verified artifact installed.
#[async_trait]
pub trait InstallerHandoff: Send + Sync {
    fn quit_policy(&self) -> QuitPolicy;

    /// Startup housekeeping, run once before polling begins.
    async fn prepare(&self) -> Result<(), UpdateError> {
        Ok(())
    }

    /// Hand the artifact to the platform installer.
    async fn deliver(&self, artifact: VerifiedArtifact) -> Result<(), UpdateError>;

    /// Restart into the new version once delivery succeeded.
    async fn restart(&self, host: &dyn HostShell);

    /// Synchronous install attempt at process quit.
    fn on_quit(&self, _artifact: VerifiedArtifact) -> Result<(), UpdateError> {
        Ok(())
    }
}

/// Pick the handoff strategy for `platform`.
///
/// macOS needs the OS updater binding supplied by the host.
pub fn build_handoff(
    platform: Platform,
    config: &UpdaterConfig,
    native: Option<Arc<dyn NativeUpdater>>,
) -> Result<Arc<dyn InstallerHandoff>, UpdateError> {
    match platform {
        Platform::MacOs => {
            let native = native.ok_or_else(|| {
                UpdateError::ConfigError("macOS handoff requires a native updater".to_string())
            })?;
            Ok(Arc::new(MacRelayHandoff::new(
                native,
                config.token_check_timeout(),
            )))
        }
        Platform::Windows => Ok(Arc::new(WindowsInstallerHandoff::new(
            Arc::new(DetachedSpawner),
            config,
        ))),
        Platform::Linux => Err(UpdateError::ConfigError(
            "automatic updates are not supported on linux".to_string(),
        )),
    }
}
