//! Device records and the local identity.

use std::fmt;

use chrono::{DateTime, Utc};
use pf_crypto::encoding::base64_bytes;
use pf_crypto::{fingerprint, SigningKeyPair};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::errors::{CoreError, Result};
use crate::store::{load_json, save_json, KeyValueStore, StoreError};

pub const IDENTITY_KEY: &str = "identity";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
    Android,
    Ios,
    Other(String),
}

impl Platform {
    /// Platform of the running process.
    pub fn current() -> Self {
        match std::env::consts::OS {
            "windows" => Platform::Windows,
            "macos" => Platform::MacOs,
            "linux" => Platform::Linux,
            "android" => Platform::Android,
            "ios" => Platform::Ios,
            other => Platform::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Windows => f.write_str("windows"),
            Platform::MacOs => f.write_str("macos"),
            Platform::Linux => f.write_str("linux"),
            Platform::Android => f.write_str("android"),
            Platform::Ios => f.write_str("ios"),
            Platform::Other(name) => f.write_str(name),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Paired,
    #[default]
    Unknown,
}

/// A device as produced by discovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub platform: Platform,
    /// Advertised Ed25519 public key.
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    pub status: DeviceStatus,
    pub last_seen: DateTime<Utc>,
    pub address: Option<String>,
}

impl Device {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key)
    }
}

/// The local device together with its signing key.
#[derive(Clone, Debug)]
pub struct LocalIdentity {
    pub device: Device,
    keys: SigningKeyPair,
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    device: Device,
    #[serde(with = "base64_bytes")]
    secret_key: Vec<u8>,
}

impl LocalIdentity {
    /// Fresh identity with a random device id and signing key.
    pub fn generate(name: impl Into<String>, platform: Platform) -> Self {
        let keys = SigningKeyPair::generate();
        let device = Device {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            platform,
            public_key: keys.public_key().to_vec(),
            status: DeviceStatus::Online,
            last_seen: Utc::now(),
            address: None,
        };
        Self { device, keys }
    }

    pub fn keys(&self) -> &SigningKeyPair {
        &self.keys
    }

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn fingerprint(&self) -> String {
        self.device.fingerprint()
    }

    /// Load the persisted identity, if any.
    pub async fn load(store: &dyn KeyValueStore) -> Result<Option<Self>> {
        let Some(stored) = load_json::<StoredIdentity>(store, IDENTITY_KEY).await? else {
            return Ok(None);
        };
        let keys = SigningKeyPair::from_secret_bytes(&stored.secret_key)?;
        if keys.public_key().as_slice() != stored.device.public_key.as_slice() {
            return Err(CoreError::Store(StoreError::DataCorruption(
                "stored identity key does not match device public key".into(),
            )));
        }
        Ok(Some(Self {
            device: stored.device,
            keys,
        }))
    }

    pub async fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        let stored = StoredIdentity {
            device: self.device.clone(),
            secret_key: self.keys.secret_bytes().to_vec(),
        };
        save_json(store, IDENTITY_KEY, &stored).await?;
        Ok(())
    }

    /// Load the persisted identity or create and persist a new one.
    pub async fn load_or_create(
        store: &dyn KeyValueStore,
        name: &str,
        platform: Platform,
    ) -> Result<Self> {
        if let Some(identity) = Self::load(store).await? {
            return Ok(identity);
        }
        let identity = Self::generate(name, platform);
        identity.save(store).await?;
        info!(
            device_id = %identity.device.id,
            fingerprint = %identity.fingerprint(),
            "Created local identity"
        );
        Ok(identity)
    }
}
