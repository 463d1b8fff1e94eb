//! CLI command definitions and argument parsing

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use semver::Version;
use serde::{Deserialize, Serialize};
use skiff_crypto::{KeyPair, PrivateKey, PublicKey};
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Skiff release tooling
#[derive(Parser, Debug)]
#[command(name = "skiff-release")]
#[command(version, about = "Sign and verify Skiff release artifacts")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug logging
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a new release signing key pair
    Keygen {
        /// Where to write the key file
        #[arg(long)]
        out: PathBuf,
        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },
    /// Sign an artifact, writing `<artifact>.sig`
    Sign {
        /// Key file produced by `keygen`
        #[arg(long)]
        key: PathBuf,
        /// Release version the signature is bound to
        #[arg(long)]
        version: String,
        artifact: PathBuf,
    },
    /// Check an artifact against its `.sig` file
    Verify {
        /// Hex-encoded public key
        #[arg(long)]
        public_key: String,
        /// Release version the signature must be bound to
        #[arg(long)]
        version: String,
        artifact: PathBuf,
    },
}

impl Cli {
    /// Run the command. `Ok(false)` means a verification did not pass.
    pub fn execute(self) -> anyhow::Result<bool> {
        match self.command {
            Commands::Keygen { out, force } => {
                let public_key = keygen(&out, force)?;
                println!("{}", public_key.to_hex());
                Ok(true)
            }
            Commands::Sign {
                key,
                version,
                artifact,
            } => {
                let sig_path = sign(&key, &version, &artifact)?;
                println!("{}", sig_path.display());
                Ok(true)
            }
            Commands::Verify {
                public_key,
                version,
                artifact,
            } => {
                let valid = verify(&public_key, &version, &artifact)?;
                println!("{}", if valid { "valid" } else { "INVALID" });
                Ok(valid)
            }
        }
    }
}

/// On-disk key file.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
struct KeyFile {
    public_key: String,
    private_key: String,
}

impl KeyFile {
    fn from_pair(pair: &KeyPair) -> Self {
        Self {
            public_key: pair.public_key.to_hex(),
            private_key: pair.private_key.to_hex(),
        }
    }

    fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read key file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse key file {}", path.display()))
    }

    fn private_key(&self) -> anyhow::Result<PrivateKey> {
        let private_key =
            PrivateKey::from_hex(&self.private_key).context("invalid private key in key file")?;
        let public_key =
            PublicKey::from_hex(&self.public_key).context("invalid public key in key file")?;
        if private_key.public_key() != public_key {
            bail!("key file public key does not match its private key");
        }
        Ok(private_key)
    }
}

fn parse_version(version: &str) -> anyhow::Result<String> {
    let parsed = Version::parse(version.trim())
        .with_context(|| format!("invalid release version '{}'", version))?;
    Ok(parsed.to_string())
}

/// Write a fresh key pair to `out` and return its public key.
pub fn keygen(out: &Path, force: bool) -> anyhow::Result<PublicKey> {
    if out.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", out.display());
    }

    let pair = skiff_crypto::generate_key_pair();
    let key_file = KeyFile::from_pair(&pair);
    let json = serde_json::to_string_pretty(&key_file)?;
    std::fs::write(out, json).with_context(|| format!("failed to write {}", out.display()))?;

    info!(path = %out.display(), "keygen: key pair written");
    Ok(pair.public_key)
}

/// Sign `artifact` for `version` with the key in `key_path`.
pub fn sign(key_path: &Path, version: &str, artifact: &Path) -> anyhow::Result<PathBuf> {
    let version = parse_version(version)?;
    let private_key = KeyFile::load(key_path)?.private_key()?;

    let sig_path = skiff_updater::write_signature(artifact, &version, &private_key)
        .with_context(|| format!("failed to sign {}", artifact.display()))?;
    info!(
        artifact = %artifact.display(),
        version = %version,
        "sign: signature written"
    );
    Ok(sig_path)
}

/// Check `artifact` against its `.sig` for `version`.
pub fn verify(public_key: &str, version: &str, artifact: &Path) -> anyhow::Result<bool> {
    let version = parse_version(version)?;
    let public_key = PublicKey::from_hex(public_key).context("invalid public key")?;

    let valid = skiff_updater::verify_signature(artifact, &version, &public_key)
        .with_context(|| format!("failed to verify {}", artifact.display()))?;
    info!(
        artifact = %artifact.display(),
        version = %version,
        valid,
        "verify: done"
    );
    Ok(valid)
}
