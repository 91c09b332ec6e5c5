//! Post-pairing message protection.
//!
//! The transport owns framing and delivery; it hands raw `SealedData`
//! buffers to and from a [`SecureChannel`].

use std::fmt;

use pf_crypto::aead::{decrypt_with_aad, encrypt_with_aad};
use pf_crypto::transcript::Transcript;
use pf_crypto::{SealedData, SymmetricKey};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::Result;

const CHANNEL_DOMAIN: &str = "pf_channel_v1";

/// Symmetric key produced by a completed pairing.
#[derive(Clone)]
pub struct SessionKey {
    session_id: String,
    local_device_id: String,
    peer_device_id: String,
    key: SymmetricKey,
}

impl SessionKey {
    pub(crate) fn new(
        session_id: String,
        local_device_id: String,
        peer_device_id: String,
        key: SymmetricKey,
    ) -> Self {
        Self {
            session_id,
            local_device_id,
            peer_device_id,
            key,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn local_device_id(&self) -> &str {
        &self.local_device_id
    }

    pub fn peer_device_id(&self) -> &str {
        &self.peer_device_id
    }

    pub fn key(&self) -> &SymmetricKey {
        &self.key
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("session_id", &self.session_id)
            .field("peer_device_id", &self.peer_device_id)
            .finish_non_exhaustive()
    }
}

/// Seals outgoing and opens incoming messages for one paired peer.
///
/// The sender and receiver device ids are bound as associated data, so a
/// message cannot be reflected back to its sender.
#[derive(Debug)]
pub struct SecureChannel {
    session: SessionKey,
}

impl SecureChannel {
    pub fn new(session: SessionKey) -> Self {
        Self { session }
    }

    pub fn peer_device_id(&self) -> &str {
        self.session.peer_device_id()
    }

    fn aad(&self, sender: &str, receiver: &str) -> Vec<u8> {
        let mut t = Transcript::new(CHANNEL_DOMAIN);
        t.append_str(1, &self.session.session_id)
            .append_str(2, sender)
            .append_str(3, receiver);
        t.as_bytes().to_vec()
    }

    pub fn seal(&self, data: &[u8]) -> Result<SealedData> {
        let aad = self.aad(&self.session.local_device_id, &self.session.peer_device_id);
        Ok(encrypt_with_aad(data, self.session.key.as_bytes(), &aad)?)
    }

    pub fn open(&self, sealed: &SealedData) -> Result<Vec<u8>> {
        let aad = self.aad(&self.session.peer_device_id, &self.session.local_device_id);
        Ok(decrypt_with_aad(sealed, self.session.key.as_bytes(), &aad)?)
    }

    pub fn seal_json<T: Serialize>(&self, value: &T) -> Result<SealedData> {
        self.seal(&serde_json::to_vec(value)?)
    }

    pub fn open_json<T: DeserializeOwned>(&self, sealed: &SealedData) -> Result<T> {
        Ok(serde_json::from_slice(&self.open(sealed)?)?)
    }
}
