#![forbid(unsafe_code)]

pub mod keys;

#[cfg(test)]
mod proptests;

pub use keys::{
    generate_key_pair, sign, verify, CryptoError, KeyPair, PrivateKey, PublicKey, Signature,
    PRIVATE_KEY_LENGTH, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};
