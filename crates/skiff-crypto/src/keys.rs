//! Release signing keys.
//!
//! Ed25519 key generation, signing and verification over raw byte buffers.
//! Key generation and signing only happen inside the release tooling; the
//! shipped client only ever holds a [`PublicKey`] and calls [`verify`].

use std::fmt;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand_core::{OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a public key in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;
/// Length of a private key (seed) in bytes.
pub const PRIVATE_KEY_LENGTH: usize = 32;
/// Length of a signature in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Error type for key and signature decoding.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid signature length: expected {expected}, got {got}")]
    InvalidSignatureLength { expected: usize, got: usize },
    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Ed25519 public key, the only key material that ships with the client.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; PUBLIC_KEY_LENGTH] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_LENGTH,
                got: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    /// Parse a hex-encoded public key, as found in the application config.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim())?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

/// Ed25519 private key seed. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; PRIVATE_KEY_LENGTH]);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; PRIVATE_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; PRIVATE_KEY_LENGTH] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: PRIVATE_KEY_LENGTH,
                got: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex::decode(s.trim())?;
        let key = Self::from_slice(&bytes);
        bytes.zeroize();
        key
    }

    pub fn as_bytes(&self) -> &[u8; PRIVATE_KEY_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Derive the matching public key.
    pub fn public_key(&self) -> PublicKey {
        let signing_key = SigningKey::from_bytes(&self.0);
        PublicKey(signing_key.verifying_key().to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// Detached Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_LENGTH]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Rejects anything that is not exactly 64 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; SIGNATURE_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidSignatureLength {
                    expected: SIGNATURE_LENGTH,
                    got: bytes.len(),
                })?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim())?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

/// A freshly generated release signing key pair.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
}

/// Generate a new key pair from a 32-byte seed drawn from the OS RNG.
pub fn generate_key_pair() -> KeyPair {
    let mut seed = [0u8; PRIVATE_KEY_LENGTH];
    OsRng.fill_bytes(&mut seed);
    let private_key = PrivateKey::from_bytes(seed);
    seed.zeroize();

    KeyPair {
        public_key: private_key.public_key(),
        private_key,
    }
}

/// Sign `message` with `private_key`. Ed25519 signatures are deterministic.
pub fn sign(private_key: &PrivateKey, message: &[u8]) -> Signature {
    let signing_key = SigningKey::from_bytes(private_key.as_bytes());
    Signature(signing_key.sign(message).to_bytes())
}

/// Verify `signature` over exactly `message` under `public_key`.
///
/// Uses strict verification: small-order public keys (including the all-zero
/// key) and non-canonical signatures are rejected. Never panics.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key.as_bytes()) else {
        return false;
    };
    let signature = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
    verifying_key.verify_strict(message, &signature).is_ok()
}
