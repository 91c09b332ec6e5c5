//! Authenticated encryption (ChaCha20-Poly1305) for all post-pairing traffic.
//!
//! The IV is drawn from the OS RNG inside every encrypt call. No function in
//! this module accepts a caller-supplied IV for encryption, so two messages
//! can never share an IV under the same key through this API.

use std::fmt;

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Nonce, Tag,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::encoding::base64_bytes;
use crate::error::{CryptoError, Result};
use crate::mac::constant_time_compare;
use crate::random::fill_random;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// A 256-bit symmetric key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn generate() -> Result<Self> {
        crate::random::generate_key()
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::bad_length("symmetric key", KEY_LEN, bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        constant_time_compare(&self.0, &other.0)
    }
}

impl Eq for SymmetricKey {}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

/// Output of [`encrypt`]: ciphertext, IV and detached tag.
///
/// This is the shape handed to the transport. In JSON every field is a
/// standard base64 string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedData {
    #[serde(with = "base64_bytes")]
    pub encrypted: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub tag: Vec<u8>,
}

impl SealedData {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| CryptoError::Encoding(e.to_string()))
    }
}

fn cipher_for(key: &[u8]) -> Result<ChaCha20Poly1305> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::bad_length("symmetric key", KEY_LEN, key.len()));
    }
    ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::bad_length("symmetric key", KEY_LEN, key.len()))
}

/// Encrypt `data` under `key` with a fresh random IV.
pub fn encrypt(data: &[u8], key: &[u8]) -> Result<SealedData> {
    encrypt_with_aad(data, key, &[])
}

/// Encrypt with associated data that is authenticated but not encrypted.
pub fn encrypt_with_aad(data: &[u8], key: &[u8], aad: &[u8]) -> Result<SealedData> {
    let cipher = cipher_for(key)?;

    let mut iv = [0u8; IV_LEN];
    fill_random(&mut iv)?;

    let mut buffer = data.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), aad, &mut buffer)
        .map_err(|_| CryptoError::InvalidInput("plaintext too large".into()))?;

    Ok(SealedData {
        encrypted: buffer,
        iv: iv.to_vec(),
        tag: tag.to_vec(),
    })
}

/// Decrypt and authenticate. Fails with [`CryptoError::Authentication`] on
/// any tampering; no plaintext is returned in that case.
pub fn decrypt(sealed: &SealedData, key: &[u8]) -> Result<Vec<u8>> {
    decrypt_with_aad(sealed, key, &[])
}

pub fn decrypt_with_aad(sealed: &SealedData, key: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;
    if sealed.iv.len() != IV_LEN {
        return Err(CryptoError::bad_length("iv", IV_LEN, sealed.iv.len()));
    }
    if sealed.tag.len() != TAG_LEN {
        return Err(CryptoError::bad_length("tag", TAG_LEN, sealed.tag.len()));
    }

    let mut buffer = sealed.encrypted.clone();
    match cipher.decrypt_in_place_detached(
        Nonce::from_slice(&sealed.iv),
        aad,
        &mut buffer,
        Tag::from_slice(&sealed.tag),
    ) {
        Ok(()) => Ok(buffer),
        Err(_) => {
            buffer.zeroize();
            Err(CryptoError::Authentication)
        }
    }
}

/// Serialize `value` as JSON and encrypt the UTF-8 bytes.
pub fn encrypt_json<T: Serialize>(value: &T, key: &[u8]) -> Result<SealedData> {
    let mut plaintext =
        serde_json::to_vec(value).map_err(|e| CryptoError::Encoding(e.to_string()))?;
    let sealed = encrypt(&plaintext, key);
    plaintext.zeroize();
    sealed
}

pub fn decrypt_json<T: DeserializeOwned>(sealed: &SealedData, key: &[u8]) -> Result<T> {
    let mut plaintext = decrypt(sealed, key)?;
    let value = serde_json::from_slice(&plaintext).map_err(|e| CryptoError::Encoding(e.to_string()));
    plaintext.zeroize();
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::generate_key;

    #[test]
    fn test_round_trip() {
        let key = generate_key().unwrap();
        let sealed = encrypt(b"Hello, encrypted world!", key.as_bytes()).unwrap();

        assert_eq!(sealed.iv.len(), IV_LEN);
        assert_eq!(sealed.tag.len(), TAG_LEN);
        assert_ne!(sealed.encrypted.as_slice(), b"Hello, encrypted world!");

        let plain = decrypt(&sealed, key.as_bytes()).unwrap();
        assert_eq!(plain.as_slice(), b"Hello, encrypted world!");
    }

    #[test]
    fn test_iv_differs_per_call() {
        let key = generate_key().unwrap();
        let a = encrypt(b"same", key.as_bytes()).unwrap();
        let b = encrypt(b"same", key.as_bytes()).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.encrypted, b.encrypted);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = generate_key().unwrap();
        let other = generate_key().unwrap();
        let sealed = encrypt(b"secret", key.as_bytes()).unwrap();
        assert_eq!(
            decrypt(&sealed, other.as_bytes()),
            Err(CryptoError::Authentication)
        );
    }

    #[test]
    fn test_tampered_tag_fails() {
        let key = generate_key().unwrap();
        let mut sealed = encrypt(b"secret", key.as_bytes()).unwrap();
        sealed.tag[0] ^= 0x01;
        assert_eq!(decrypt(&sealed, key.as_bytes()), Err(CryptoError::Authentication));
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = generate_key().unwrap();
        let sealed = encrypt_with_aad(b"secret", key.as_bytes(), b"peer-a").unwrap();
        assert!(decrypt_with_aad(&sealed, key.as_bytes(), b"peer-a").is_ok());
        assert_eq!(
            decrypt_with_aad(&sealed, key.as_bytes(), b"peer-b"),
            Err(CryptoError::Authentication)
        );
    }

    #[test]
    fn test_malformed_sizes_are_input_errors() {
        let key = generate_key().unwrap();
        assert!(matches!(encrypt(b"x", &[0u8; 16]), Err(CryptoError::InvalidInput(_))));

        let mut sealed = encrypt(b"x", key.as_bytes()).unwrap();
        sealed.iv.pop();
        assert!(matches!(decrypt(&sealed, key.as_bytes()), Err(CryptoError::InvalidInput(_))));

        let mut sealed = encrypt(b"x", key.as_bytes()).unwrap();
        sealed.tag.truncate(8);
        assert!(matches!(decrypt(&sealed, key.as_bytes()), Err(CryptoError::InvalidInput(_))));
    }

    #[test]
    fn test_json_wrappers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Note {
            title: String,
            pages: u32,
        }

        let key = generate_key().unwrap();
        let note = Note { title: "handover".into(), pages: 3 };
        let sealed = encrypt_json(&note, key.as_bytes()).unwrap();

        let text = sealed.to_json().unwrap();
        let parsed = SealedData::from_json(&text).unwrap();
        assert_eq!(parsed, sealed);

        let back: Note = decrypt_json(&parsed, key.as_bytes()).unwrap();
        assert_eq!(back, note);
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = SymmetricKey::from_bytes([0xAB; KEY_LEN]);
        assert_eq!(format!("{:?}", key), "SymmetricKey(<redacted>)");
    }
}
