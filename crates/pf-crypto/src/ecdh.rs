//! X25519 key agreement used by the pairing handshake.

use std::fmt;

use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};

pub const PUBLIC_KEY_LEN: usize = 32;

/// Raw Diffie-Hellman output. Not a key by itself; feed it to
/// [`crate::kdf::derive_session_key`].
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// An X25519 key pair.
///
/// The secret half stays inside; peers only ever see [`Self::public_key`].
pub struct EcdhKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EcdhKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    /// Diffie-Hellman with a peer public key.
    ///
    /// Low-order peer points yield an all-zero result; those are rejected.
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<SharedSecret> {
        let peer = parse_public_key(peer_public)?;
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidInput(
                "non-contributory peer public key".into(),
            ));
        }
        Ok(SharedSecret(shared.to_bytes()))
    }
}

impl fmt::Debug for EcdhKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcdhKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

fn parse_public_key(bytes: &[u8]) -> Result<PublicKey> {
    let arr: [u8; PUBLIC_KEY_LEN] = bytes
        .try_into()
        .map_err(|_| CryptoError::bad_length("x25519 public key", PUBLIC_KEY_LEN, bytes.len()))?;
    Ok(PublicKey::from(arr))
}
