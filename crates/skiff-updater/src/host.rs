//! Seam between the update pipeline and the host application's UI and
//! lifecycle.

use async_trait::async_trait;
use semver::Version;

use crate::download::DownloadProgress;

/// User-facing prompts the pipeline can raise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    /// Ask whether to restart now to apply `version`
    RestartToUpdate { version: Version },
    /// Automatic updating failed; acknowledge only
    CannotUpdate,
    /// The release must be installed by hand; acknowledge only
    CannotUpdateRequireManual,
    /// The release does not support this OS version; acknowledge only
    UnsupportedOs,
    /// The app runs from a read-only volume and must be moved first
    ReadOnlyVolume,
}

impl Prompt {
    /// Whether the prompt only offers an acknowledgement.
    pub fn is_acknowledge_only(&self) -> bool {
        !matches!(self, Prompt::RestartToUpdate { .. })
    }
}

/// Answer to a [`Prompt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptResponse {
    Accepted,
    Declined,
    Acknowledged,
}

/// Host application capabilities the pipeline drives.
#[async_trait]
pub trait HostShell: Send + Sync {
    /// Show a prompt in the host's own UI and wait for the answer.
    async fn show(&self, prompt: Prompt) -> PromptResponse;

    /// Show a prompt as a native OS dialog, used when the host UI does not respond.
    async fn show_native_dialog(&self, prompt: Prompt);

    /// Tell the host the upcoming quit is intentional and must not be vetoed.
    fn mark_should_quit(&self);

    /// Quit the host application.
    fn quit(&self);

    /// Artifact download progress, reported per received chunk.
    fn download_progress(&self, _progress: DownloadProgress) {}
}
