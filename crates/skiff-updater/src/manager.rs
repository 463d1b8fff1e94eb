//! Update manager - orchestrates the complete update flow.
//!
//! One poll cycle walks
//! `Idle → Checking → Found → Downloading → Downloaded → Verifying →
//! Verified → AwaitingConsent → Accepted → HandingOff → Installing →
//! Restarting`, dropping back to `Idle` on no update, a declined prompt, a
//! verification failure or any error. Overlapping cycles are no-ops, and a
//! release the user was already asked about is not offered again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use semver::Version;
use skiff_crypto::PublicKey;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::{CachedDownload, UpdateCache};
use crate::config::UpdaterConfig;
use crate::download::Downloader;
use crate::error::UpdateError;
use crate::feed::{HttpFeed, UpdateFeed, UpdateInfo};
use crate::handoff::{InstallerHandoff, QuitPolicy};
use crate::host::{HostShell, Prompt, PromptResponse};
use crate::platform::{current_arch, current_os_release, Platform};
use crate::verify::{verify_download, VerifiedArtifact};

/// Current state of the update manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateState {
    #[default]
    Idle,
    Checking,
    NoUpdate,
    Found,
    Downloading,
    Downloaded,
    Verifying,
    Failed,
    Verified,
    AwaitingConsent,
    Declined,
    Accepted,
    HandingOff,
    Installing,
    /// Terminal; later cycles do nothing
    Restarting,
}

/// How a single poll cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle was running, or the app is already restarting
    Skipped,
    NoUpdate,
    /// The release already failed verification in this process
    AlreadyRejected,
    /// The user was already asked about this release, or a newer one
    AlreadyOffered,
    VerificationFailed,
    Declined,
    /// Transient feed or download failure; retried next tick
    Failed,
    /// Handoff or feed failure that was reported to the user
    CannotUpdate,
    Restarting,
}

#[derive(Debug, Default)]
struct UpdateSessionState {
    state: UpdateState,
    marked_cannot_update: bool,
    rejected: Option<(String, Version)>,
    offered: Option<(String, Version)>,
}

/// Clears the reentrancy flag when the cycle ends, however it ends.
struct UpdatingGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> UpdatingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for UpdatingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Main update manager.
pub struct UpdateManager {
    config: UpdaterConfig,
    public_key: PublicKey,
    feed: Arc<dyn UpdateFeed>,
    cache: UpdateCache,
    handoff: Arc<dyn InstallerHandoff>,
    host: Arc<dyn HostShell>,
    session: RwLock<UpdateSessionState>,
    is_updating: AtomicBool,
}

impl UpdateManager {
    /// Assemble a manager from its parts. Fails if the configured public key
    /// does not parse or the configuration is unusable.
    pub fn new(
        config: UpdaterConfig,
        feed: Arc<dyn UpdateFeed>,
        cache: UpdateCache,
        handoff: Arc<dyn InstallerHandoff>,
        host: Arc<dyn HostShell>,
    ) -> Result<Self, UpdateError> {
        config.validate()?;
        let public_key = config.public_key()?;
        Ok(Self {
            config,
            public_key,
            feed,
            cache,
            handoff,
            host,
            session: RwLock::new(UpdateSessionState::default()),
            is_updating: AtomicBool::new(false),
        })
    }

    /// Build the HTTP feed and download cache from `config`. Download
    /// progress is forwarded to the host shell.
    pub fn for_platform(
        config: UpdaterConfig,
        current_version: Version,
        platform: Platform,
        handoff: Arc<dyn InstallerHandoff>,
        host: Arc<dyn HostShell>,
    ) -> Result<Self, UpdateError> {
        let mut downloader = Downloader::new()?;
        let progress_host = Arc::clone(&host);
        downloader.set_progress_callback(move |progress| progress_host.download_progress(progress));
        let downloader = Arc::new(downloader);

        let feed = HttpFeed::new(
            Arc::clone(&downloader),
            config.updates_url.clone(),
            current_version,
            platform,
            current_arch(),
        )
        .with_os_release(current_os_release());
        let cache = UpdateCache::new(
            downloader,
            config.updates_url.clone(),
            config.cache_dir(),
            config.temp_dir(),
        );
        Self::new(config, Arc::new(feed), cache, handoff, host)
    }

    pub async fn state(&self) -> UpdateState {
        self.session.read().await.state
    }

    async fn set_state(&self, state: UpdateState) {
        debug!(?state, "updater: state");
        self.session.write().await.state = state;
    }

    /// Start polling. Returns `None` without doing anything when updates are
    /// disabled for this build or user.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.config.auto_update_allowed() {
            info!(
                packaging = ?self.config.packaging,
                updates_enabled = self.config.updates_enabled,
                auto_update = self.config.auto_update,
                "updater: auto-update disabled"
            );
            return None;
        }

        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            if let Err(e) = manager.handoff.prepare().await {
                warn!("updater: startup cleanup failed: {}", e);
            }
            manager.cache.remove_stale_temp().await;

            let mut interval = tokio::time::interval(manager.config.poll_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                if manager.state().await == UpdateState::Restarting {
                    break;
                }
                let cycle = Arc::clone(&manager);
                tokio::spawn(async move {
                    let outcome = cycle.check_and_install().await;
                    debug!(?outcome, "updater: poll cycle finished");
                });
            }
        }))
    }

    /// Run one poll cycle.
    pub async fn check_and_install(&self) -> CycleOutcome {
        let Some(_guard) = UpdatingGuard::acquire(&self.is_updating) else {
            debug!("checkForUpdatesMaybeInstall: update already in progress");
            return CycleOutcome::Skipped;
        };
        if self.state().await == UpdateState::Restarting {
            return CycleOutcome::Skipped;
        }

        match self.run_cycle().await {
            Ok(outcome) => outcome,
            Err(e) => self.handle_error(e).await,
        }
    }

    async fn run_cycle(&self) -> Result<CycleOutcome, UpdateError> {
        self.set_state(UpdateState::Checking).await;
        let info = match self.feed.check().await? {
            Some(info) => info,
            None => {
                self.set_state(UpdateState::NoUpdate).await;
                self.set_state(UpdateState::Idle).await;
                return Ok(CycleOutcome::NoUpdate);
            }
        };

        if self.is_rejected(&info).await {
            info!(
                version = %info.version,
                file_name = %info.file_name,
                "checkForUpdatesMaybeInstall: release already failed verification, skipping"
            );
            self.set_state(UpdateState::Idle).await;
            return Ok(CycleOutcome::AlreadyRejected);
        }
        if self.was_offered(&info).await {
            debug!(
                version = %info.version,
                "checkForUpdatesMaybeInstall: already offered, waiting for a newer release"
            );
            self.set_state(UpdateState::Idle).await;
            return Ok(CycleOutcome::AlreadyOffered);
        }

        self.set_state(UpdateState::Found).await;
        self.set_state(UpdateState::Downloading).await;
        let download = self.cache.ensure(&info).await?;
        self.set_state(UpdateState::Downloaded).await;

        self.set_state(UpdateState::Verifying).await;
        let artifact = match self.verify(download).await {
            Ok(artifact) => artifact,
            Err(e @ UpdateError::SignatureInvalid { .. }) => {
                // The cache is kept so the broken release is not fetched again.
                self.session.write().await.rejected = Some((info.file_name, info.version));
                self.set_state(UpdateState::Failed).await;
                self.mark_cannot_update(&e, Prompt::CannotUpdate).await;
                self.set_state(UpdateState::Idle).await;
                return Ok(CycleOutcome::VerificationFailed);
            }
            Err(e) => return Err(e),
        };
        self.set_state(UpdateState::Verified).await;

        self.set_state(UpdateState::AwaitingConsent).await;
        let version = artifact.version().clone();
        self.session.write().await.offered = Some((info.file_name, version.clone()));
        let response = self
            .host
            .show(Prompt::RestartToUpdate {
                version: version.clone(),
            })
            .await;
        if response != PromptResponse::Accepted {
            info!(version = %version, "downloadAndInstall: user declined update");
            self.set_state(UpdateState::Declined).await;
            self.set_state(UpdateState::Idle).await;
            return Ok(CycleOutcome::Declined);
        }
        self.set_state(UpdateState::Accepted).await;

        self.set_state(UpdateState::HandingOff).await;
        self.handoff.deliver(artifact).await?;

        self.set_state(UpdateState::Installing).await;
        info!(version = %version, "downloadAndInstall: restarting to install");
        self.host.mark_should_quit();
        self.handoff.restart(self.host.as_ref()).await;
        self.set_state(UpdateState::Restarting).await;

        Ok(CycleOutcome::Restarting)
    }

    /// Hashing a large artifact is blocking work.
    async fn verify(&self, download: CachedDownload) -> Result<VerifiedArtifact, UpdateError> {
        let public_key = self.public_key;
        tokio::task::spawn_blocking(move || verify_download(&download, &public_key))
            .await
            .map_err(|e| UpdateError::IoError(std::io::Error::other(e.to_string())))?
    }

    async fn is_rejected(&self, info: &UpdateInfo) -> bool {
        self.session
            .read()
            .await
            .rejected
            .as_ref()
            .is_some_and(|(file_name, version)| {
                *file_name == info.file_name && *version == info.version
            })
    }

    /// Whether the user was already asked about this release or a newer one.
    async fn was_offered(&self, info: &UpdateInfo) -> bool {
        self.session
            .read()
            .await
            .offered
            .as_ref()
            .is_some_and(|(_, version)| info.version <= *version)
    }

    async fn handle_error(&self, e: UpdateError) -> CycleOutcome {
        if e.is_transient() {
            warn!("checkForUpdatesMaybeInstall: {}; retrying on next tick", e);
            self.set_state(UpdateState::Idle).await;
            return CycleOutcome::Failed;
        }

        let prompt = match e {
            UpdateError::ReadOnlyVolume => Prompt::ReadOnlyVolume,
            UpdateError::ManualUpdateRequired => Prompt::CannotUpdateRequireManual,
            UpdateError::UnsupportedOs { .. } => Prompt::UnsupportedOs,
            _ => Prompt::CannotUpdate,
        };
        self.mark_cannot_update(&e, prompt).await;
        self.set_state(UpdateState::Idle).await;
        CycleOutcome::CannotUpdate
    }

    /// Show an acknowledge-only failure prompt, at most once per process.
    async fn mark_cannot_update(&self, e: &UpdateError, prompt: Prompt) {
        {
            let mut session = self.session.write().await;
            if session.marked_cannot_update {
                warn!("markCannotUpdate: already marked: {}", e);
                return;
            }
            session.marked_cannot_update = true;
        }

        error!(?prompt, "markCannotUpdate: marking due to error: {}", e);
        if prompt == Prompt::ReadOnlyVolume {
            self.show_read_only_prompt().await;
        } else {
            self.host.show(prompt).await;
        }
    }

    /// The read-only volume prompt falls back to a native dialog if the host
    /// does not acknowledge in time.
    async fn show_read_only_prompt(&self) {
        let timeout = self.config.read_only_ack_timeout();
        match tokio::time::timeout(timeout, self.host.show(Prompt::ReadOnlyVolume)).await {
            Ok(_) => debug!("markCannotUpdate: read-only volume prompt acknowledged"),
            Err(_) => {
                warn!(
                    "markCannotUpdate: host did not acknowledge within {:?}, showing native dialog",
                    timeout
                );
                self.host.show_native_dialog(Prompt::ReadOnlyVolume).await;
            }
        }
    }

    /// Process-quit hook. Best-effort: failures are logged. A download in
    /// flight is abandoned, not waited for.
    pub async fn shutdown(&self) {
        match self.handoff.quit_policy() {
            QuitPolicy::ClearCache => {
                if let Err(e) = self.cache.clear().await {
                    warn!("onQuit: failed to delete cache: {}", e);
                }
            }
            QuitPolicy::LastChanceInstall => {
                if self.state().await == UpdateState::Restarting {
                    return;
                }
                let Some(download) = self.cache.current().await else {
                    return;
                };
                match verify_download(&download, &self.public_key) {
                    Ok(artifact) => {
                        if let Err(e) = self.handoff.on_quit(artifact) {
                            warn!("onQuit: last chance install failed: {}", e);
                        }
                    }
                    Err(e) => warn!("onQuit: cached update not installable: {}", e),
                }
            }
        }
    }
}
