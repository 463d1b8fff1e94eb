//! # skiff-updater
//!
//! Secure auto-update pipeline for the Skiff desktop client.
//!
//! This crate handles:
//! - Polling the release feed for a newer version
//! - Downloading the artifact and its detached `.sig` into a single-slot cache
//! - Verifying the Ed25519 release signature over `sha256(artifact) + "-" + version`
//! - Handing the verified artifact to the platform installer
//!   (a loopback relay for the macOS updater, a detached installer on Windows)
//!
//! ## Security
//!
//! An installer can only ever be given a [`VerifiedArtifact`], and the only
//! way to obtain one is [`verify_download`].

#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod feed;
pub mod handoff;
pub mod host;
pub mod manager;
pub mod platform;
#[cfg(test)]
mod proptests;
pub mod signature;
#[cfg(test)]
mod test_support;
pub mod verify;

// Re-export main types for convenience
pub use cache::{CachedDownload, UpdateCache};
pub use config::{Packaging, UpdaterConfig};
pub use download::{DownloadProgress, Downloader, DownloaderConfig};
pub use error::UpdateError;
pub use feed::{HttpFeed, UpdateFeed, UpdateInfo};
pub use handoff::{
    build_handoff, InstallerHandoff, MacRelayHandoff, NativeUpdater, NativeUpdaterEvent,
    ProcessSpawner, QuitPolicy, WindowsInstallerHandoff,
};
pub use host::{HostShell, Prompt, PromptResponse};
pub use manager::{CycleOutcome, UpdateManager, UpdateState};
pub use platform::Platform;
pub use signature::{compute_release_message, verify_signature, write_signature};
pub use verify::{is_valid, verify_download, VerifiedArtifact};
