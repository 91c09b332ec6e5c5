//! HMAC-SHA256 tamper evidence and constant-time comparison.

use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{CryptoError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const MAC_LEN: usize = 32;

/// Compare two byte slices in constant time.
///
/// Slices of different lengths compare unequal; the length itself is not
/// treated as secret.
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    constant_time_eq(a, b)
}

/// HMAC-SHA256 of `data` under `key`.
pub fn generate_hmac(data: &[u8], key: &[u8]) -> Result<[u8; MAC_LEN]> {
    if key.is_empty() {
        return Err(CryptoError::InvalidInput("hmac key must not be empty".into()));
    }
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidInput("hmac key".into()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Verify an HMAC produced by [`generate_hmac`].
pub fn verify_hmac(data: &[u8], key: &[u8], expected: &[u8]) -> Result<()> {
    if expected.len() != MAC_LEN {
        return Err(CryptoError::bad_length("hmac", MAC_LEN, expected.len()));
    }
    let computed = generate_hmac(data, key)?;
    if constant_time_compare(&computed, expected) {
        Ok(())
    } else {
        Err(CryptoError::Authentication)
    }
}
