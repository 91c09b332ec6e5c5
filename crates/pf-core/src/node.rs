//! Composition root for one device.
//!
//! Wires identity, certificate service, rate limiter and pairing manager
//! over a single store.

use std::sync::Arc;

use tracing::info;

use crate::certificate::CertificateService;
use crate::config::CoreConfig;
use crate::errors::Result;
use crate::pairing::{Clock, PairingManager};
use crate::rate_limit::RateLimiter;
use crate::store::KeyValueStore;
use crate::types::{LocalIdentity, Platform};

pub struct PortalCore {
    config: CoreConfig,
    store: Arc<dyn KeyValueStore>,
    certificates: Arc<CertificateService>,
    limiter: Arc<RateLimiter>,
    pairing: PairingManager,
}

impl PortalCore {
    /// Open the device state held in `store`, creating an identity named
    /// `device_name` on first use.
    pub async fn open(
        config: CoreConfig,
        store: Arc<dyn KeyValueStore>,
        device_name: &str,
    ) -> Result<Self> {
        Self::open_with_clock(config, store, device_name, None).await
    }

    pub async fn open_with_clock(
        config: CoreConfig,
        store: Arc<dyn KeyValueStore>,
        device_name: &str,
        clock: Option<Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let identity =
            LocalIdentity::load_or_create(store.as_ref(), device_name, Platform::current()).await?;
        let certificates = Arc::new(
            CertificateService::load(store.clone(), config.certificates.validity_days).await?,
        );
        certificates.local_certificate(&identity).await?;

        let limiter = Arc::new(RateLimiter::new(config.rate_limit_config()));
        let mut pairing = PairingManager::new(
            identity,
            certificates.clone(),
            limiter.clone(),
            store.clone(),
            config.pairing.clone(),
        )
        .await?;
        if let Some(clock) = clock {
            pairing = pairing.with_clock(clock);
        }

        info!(
            device_id = %pairing.identity().device_id(),
            fingerprint = %pairing.identity().fingerprint(),
            "Portal core ready"
        );

        Ok(Self {
            config,
            store,
            certificates,
            limiter,
            pairing,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn identity(&self) -> &LocalIdentity {
        self.pairing.identity()
    }

    pub fn certificates(&self) -> &Arc<CertificateService> {
        &self.certificates
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn pairing(&self) -> &PairingManager {
        &self.pairing
    }
}
