//! Verification gate between the download cache and the installer handoff.
//!
//! [`VerifiedArtifact`] can only be obtained from [`verify_download`], and
//! every handoff entry point takes one by value, so an unverified download
//! cannot reach an installer:
//!
//! ```compile_fail
//! use skiff_updater::VerifiedArtifact;
//!
//! let forged = VerifiedArtifact {
//!     path: std::path::PathBuf::from("/tmp/evil.zip"),
//!     file_name: "evil.zip".to_string(),
//!     version: semver::Version::new(9, 9, 9),
//! };
//! ```

use std::path::Path;

use semver::Version;
use skiff_crypto::PublicKey;
use tracing::{error, info};

use crate::cache::CachedDownload;
use crate::error::UpdateError;
use crate::signature::verify_signature;

/// A cached artifact whose release signature has been checked.
#[derive(Debug)]
pub struct VerifiedArtifact {
    path: std::path::PathBuf,
    file_name: String,
    version: Version,
}

impl VerifiedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }
}

/// Check a cached download against the release public key.
///
/// A signature that decodes but does not match, or that cannot be decoded,
/// is reported as [`UpdateError::SignatureInvalid`]. I/O failures (for
/// example the cached file vanished) are passed through unchanged.
pub fn verify_download(
    download: &CachedDownload,
    public_key: &PublicKey,
) -> Result<VerifiedArtifact, UpdateError> {
    let version = download.version().to_string();
    let outcome = verify_signature(download.file_path(), &version, public_key);

    match outcome {
        Ok(true) => {
            info!(
                version = %version,
                file_name = download.file_name(),
                "verifyDownload: signature verified"
            );
            Ok(VerifiedArtifact {
                path: download.file_path().to_path_buf(),
                file_name: download.file_name().to_string(),
                version: download.version().clone(),
            })
        }
        Ok(false) | Err(UpdateError::MalformedSignature(_)) => {
            error!(
                version = %version,
                file_name = download.file_name(),
                "verifyDownload: downloaded update did not pass signature verification"
            );
            Err(UpdateError::SignatureInvalid {
                version,
                file_name: download.file_name().to_string(),
            })
        }
        Err(e) => Err(e),
    }
}

/// Boolean form of [`verify_download`]; any failure is `false`.
pub fn is_valid(download: &CachedDownload, public_key: &PublicKey) -> bool {
    verify_download(download, public_key).is_ok()
}
