//! Key derivation.
//!
//! Two derivations live here: a deliberately expensive password-based one
//! (Argon2id, fixed cost) for human secrets, and HKDF-SHA256 for turning a
//! key-agreement result into a session key.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::aead::{SymmetricKey, KEY_LEN};
use crate::error::{CryptoError, Result};
use crate::random::random_array;

/// Length of the salt generated by [`derive_key`] when none is given.
pub const SALT_LEN: usize = 16;
/// Minimum salt length accepted for password derivation.
pub const MIN_SALT_LEN: usize = 8;

/// Argon2id passes over memory.
pub const PASSWORD_KDF_ITERATIONS: u32 = 3;
/// Argon2id memory cost in KiB (19 MiB).
pub const PASSWORD_KDF_MEMORY_KIB: u32 = 19 * 1024;

/// Result of a password derivation: the key and the salt that produced it.
#[derive(Debug, Clone)]
pub struct DerivedKey {
    pub key: SymmetricKey,
    pub salt: Vec<u8>,
}

/// Derive a 256-bit key from a password.
///
/// Deterministic for a given `(password, salt)`; a random salt is generated
/// when `salt` is `None`.
pub fn derive_key(password: &[u8], salt: Option<&[u8]>) -> Result<DerivedKey> {
    let salt = match salt {
        Some(s) => s.to_vec(),
        None => random_array::<SALT_LEN>()?.to_vec(),
    };
    if salt.len() < MIN_SALT_LEN {
        return Err(CryptoError::InvalidInput(format!(
            "salt must be at least {MIN_SALT_LEN} bytes, got {}",
            salt.len()
        )));
    }

    let params = Params::new(
        PASSWORD_KDF_MEMORY_KIB,
        PASSWORD_KDF_ITERATIONS,
        1,
        Some(KEY_LEN),
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = [0u8; KEY_LEN];
    argon
        .hash_password_into(password, &salt, &mut out)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let key = SymmetricKey::from_bytes(out);
    out.zeroize();
    Ok(DerivedKey { key, salt })
}

/// HKDF-SHA256 expansion of a shared secret into a session key.
pub fn derive_session_key(shared_secret: &[u8], salt: &[u8], info: &[u8]) -> Result<SymmetricKey> {
    if shared_secret.is_empty() {
        return Err(CryptoError::InvalidInput("shared secret must not be empty".into()));
    }
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation("hkdf expand".into()))?;
    let key = SymmetricKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}
