//! Error types for the Portal Fusion core.
//!
//! Crypto and trust failures surface immediately and are never retried.
//! Only [`CoreError::RateLimitExceeded`] is recoverable by waiting.

use std::time::Duration;

use pf_crypto::CryptoError;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Malformed key, IV, tag or ciphertext sizes.
    #[error("invalid crypto input: {0}")]
    CryptoInput(String),

    /// Tag, HMAC, signature or PIN mismatch.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Operating on an unverified or invalid certificate.
    #[error("trust error: {0}")]
    Trust(String),

    #[error("pairing session expired: {0}")]
    SessionExpired(String),

    #[error("pairing session not found: {0}")]
    SessionNotFound(String),

    #[error("rate limit exceeded: {reason} (retry after {}ms)", .retry_after.as_millis())]
    RateLimitExceeded { reason: String, retry_after: Duration },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("crypto failure: {0}")]
    Crypto(String),
}

impl CoreError {
    /// True when retrying after a delay can succeed without new credentials.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CoreError::RateLimitExceeded { .. })
    }
}

impl From<CryptoError> for CoreError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidInput(msg) => CoreError::CryptoInput(msg),
            CryptoError::Authentication => {
                CoreError::Authentication("cryptographic verification failed".into())
            }
            other => CoreError::Crypto(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::InvalidPayload(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
