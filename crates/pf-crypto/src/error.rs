//! Error type shared by every primitive in this crate.

use thiserror::Error;

/// Errors produced by key material operations.
///
/// `InvalidInput` covers malformed sizes (keys, IVs, tags, public keys);
/// `Authentication` covers every tag, MAC or signature mismatch. Neither
/// variant carries secret material.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid crypto input: {0}")]
    InvalidInput(String),

    #[error("authentication failed")]
    Authentication,

    #[error("secure random source failed")]
    Rng,

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

impl CryptoError {
    pub(crate) fn bad_length(what: &str, expected: usize, got: usize) -> Self {
        CryptoError::InvalidInput(format!(
            "{what}: expected {expected} bytes, got {got}"
        ))
    }
}

pub type Result<T> = std::result::Result<T, CryptoError>;
