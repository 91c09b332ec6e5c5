//! Ed25519 device signing keys.
//!
//! A device's advertised public key is its Ed25519 verifying key; the
//! matching signing key self-signs the device certificate.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SECRET_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// Ed25519 key pair. `SigningKey` zeroizes itself on drop.
#[derive(Clone)]
pub struct SigningKeyPair {
    signing: SigningKey,
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a key pair from its 32-byte secret seed.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let seed: [u8; SECRET_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::bad_length("ed25519 secret key", SECRET_KEY_LEN, bytes.len()))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
        })
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; SECRET_KEY_LEN]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        let signature: Signature = self.signing.sign(message);
        signature.to_bytes()
    }
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature (strict verification).
///
/// Malformed key or signature sizes are input errors; a well-formed
/// signature that does not verify is an authentication error.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let key: [u8; PUBLIC_KEY_LEN] = public_key
        .try_into()
        .map_err(|_| CryptoError::bad_length("ed25519 public key", PUBLIC_KEY_LEN, public_key.len()))?;
    let sig: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| CryptoError::bad_length("ed25519 signature", SIGNATURE_LEN, signature.len()))?;

    let verifying_key = VerifyingKey::from_bytes(&key)
        .map_err(|_| CryptoError::InvalidInput("invalid ed25519 public key".into()))?;
    verifying_key
        .verify_strict(message, &Signature::from_bytes(&sig))
        .map_err(|_| CryptoError::Authentication)
}
