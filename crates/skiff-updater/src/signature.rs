//! Release signature protocol.
//!
//! A release artifact is signed over the message
//! `hex(sha256(artifact)) + "-" + version`, and the hex-encoded signature is
//! stored next to the artifact as `<artifact>.sig`. Binding the version into
//! the message stops a validly signed old artifact from being replayed under
//! a newer version label.

use std::ffi::OsString;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use skiff_crypto::{PrivateKey, PublicKey, Signature};
use tracing::{debug, warn};

use crate::error::UpdateError;

/// Buffer size for streaming artifacts through the hasher.
const HASH_BUFFER_SIZE: usize = 8192;

/// Extension appended to an artifact file name for its detached signature.
pub const SIGNATURE_EXTENSION: &str = "sig";

/// `<file name>.sig` for an artifact file name.
pub fn signature_file_name(file_name: &str) -> String {
    format!("{}.{}", file_name, SIGNATURE_EXTENSION)
}

/// Sibling signature path: the `.sig` suffix is appended, never substituted.
pub fn signature_path(artifact: &Path) -> PathBuf {
    let mut name: OsString = artifact.as_os_str().to_owned();
    name.push(".");
    name.push(SIGNATURE_EXTENSION);
    PathBuf::from(name)
}

/// Stream a file through SHA-256 without loading it into memory.
pub fn hash_file(path: &Path) -> Result<[u8; 32], UpdateError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().into())
}

/// Build the message a release signature covers.
pub fn compute_release_message(artifact: &Path, version: &str) -> Result<Vec<u8>, UpdateError> {
    let digest = hash_file(artifact)?;
    Ok(format!("{}-{}", hex::encode(digest), version).into_bytes())
}

/// Sign an artifact and write the hex signature to `<artifact>.sig`.
///
/// Release tooling only; the shipped client never holds a private key.
pub fn write_signature(
    artifact: &Path,
    version: &str,
    private_key: &PrivateKey,
) -> Result<PathBuf, UpdateError> {
    let message = compute_release_message(artifact, version)?;
    let signature = skiff_crypto::sign(private_key, &message);
    let sig_path = signature_path(artifact);
    std::fs::write(&sig_path, signature.to_hex())?;

    debug!(
        path = %sig_path.display(),
        version,
        "writeSignature: signature written"
    );
    Ok(sig_path)
}

/// Read and decode a `.sig` file.
pub fn read_signature(sig_path: &Path) -> Result<Signature, UpdateError> {
    let content = std::fs::read_to_string(sig_path)?;
    Ok(Signature::from_hex(&content)?)
}

/// Verify an artifact against its sibling `.sig` file.
///
/// The message is recomputed from the bytes on disk. A missing or malformed
/// signature file is reported as an error; a well-formed signature that does
/// not verify yields `Ok(false)`.
pub fn verify_signature(
    artifact: &Path,
    version: &str,
    public_key: &PublicKey,
) -> Result<bool, UpdateError> {
    let signature = read_signature(&signature_path(artifact))?;
    let message = compute_release_message(artifact, version)?;
    let valid = skiff_crypto::verify(public_key, &message, &signature);

    if !valid {
        warn!(
            path = %artifact.display(),
            version,
            "verifySignature: signature does not match artifact"
        );
    }
    Ok(valid)
}
