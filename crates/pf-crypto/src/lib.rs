#![forbid(unsafe_code)]

//! Portal Fusion key material primitives.
//!
//! Everything in this crate is stateless: callers supply keys and get
//! values back. Secret-bearing types zeroize on drop and never print
//! their contents through `Debug`.

pub mod error;
pub mod encoding;
pub mod hash;
pub mod random;
pub mod transcript;

pub mod aead;
pub mod kdf;
pub mod mac;

pub mod ecdh;
pub mod signing;
pub mod pake;
pub mod rsa_keys;

#[cfg(test)]
mod proptests;

pub use aead::{decrypt, decrypt_json, encrypt, encrypt_json, SealedData, SymmetricKey};
pub use ecdh::{EcdhKeyPair, SharedSecret};
pub use error::{CryptoError, Result};
pub use hash::{fingerprint, hash, HashAlgorithm};
pub use kdf::{derive_key, derive_session_key, DerivedKey};
pub use mac::{constant_time_compare, generate_hmac, verify_hmac};
pub use pake::{pake_respond, PakeInitiator, PakeKey, PAKE_MESSAGE_LEN};
pub use random::{generate_key, generate_pin, generate_token};
pub use rsa_keys::{rsa_encrypt, rsa_verify, RsaKeyPair};
pub use signing::{verify_signature, SigningKeyPair};
