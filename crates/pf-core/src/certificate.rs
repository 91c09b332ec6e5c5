//! Self-issued device certificates and the trust store.
//!
//! A certificate binds a device id to its Ed25519 public key and is signed
//! by that same key. Trust is a separate decision recorded by fingerprint;
//! [`CertificateService`] is the only place that decision is made.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use pf_crypto::encoding::base64_bytes;
use pf_crypto::random::random_array;
use pf_crypto::transcript::Transcript;
use pf_crypto::{fingerprint, verify_signature};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{CoreError, Result};
use crate::store::{load_json, save_json, KeyValueStore};
use crate::types::LocalIdentity;

pub const DEFAULT_VALIDITY_DAYS: u32 = 365;

pub const CERTIFICATES_KEY: &str = "certificates";
pub const TRUSTED_FINGERPRINTS_KEY: &str = "trusted_fingerprints";

pub const PEM_HEADER: &str = "-----BEGIN PORTAL FUSION CERTIFICATE-----";
pub const PEM_FOOTER: &str = "-----END PORTAL FUSION CERTIFICATE-----";
const PEM_LINE_WIDTH: usize = 64;

const CERT_DOMAIN: &str = "pf_certificate_v1";
const SERIAL_LEN: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: String,
    pub device_id: String,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    pub fingerprint: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub issuer: String,
    pub subject: String,
    pub serial_number: String,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    #[serde(default)]
    pub verified: bool,
}

impl Certificate {
    /// Canonical encoding of every field except `signature` and `verified`.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut t = Transcript::new(CERT_DOMAIN);
        t.append_str(1, &self.id)
            .append_str(2, &self.device_id)
            .append_bytes(3, &self.public_key)
            .append_str(4, &self.fingerprint)
            .append_i64(5, self.issued_at.timestamp())
            .append_u64(6, u64::from(self.issued_at.timestamp_subsec_nanos()))
            .append_i64(7, self.expires_at.timestamp())
            .append_u64(8, u64::from(self.expires_at.timestamp_subsec_nanos()))
            .append_str(9, &self.issuer)
            .append_str(10, &self.subject)
            .append_str(11, &self.serial_number);
        t.as_bytes().to_vec()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Build a self-signed certificate for the local identity.
pub fn generate_certificate(identity: &LocalIdentity, validity_days: u32) -> Result<Certificate> {
    generate_certificate_at(identity, validity_days, Utc::now())
}

pub fn generate_certificate_at(
    identity: &LocalIdentity,
    validity_days: u32,
    now: DateTime<Utc>,
) -> Result<Certificate> {
    if validity_days == 0 {
        return Err(CoreError::Config("validity_days must be positive".into()));
    }

    let device = &identity.device;
    let public_key = identity.keys().public_key().to_vec();
    let name = format!("CN={},UID={}", device.name, device.id);
    let serial: [u8; SERIAL_LEN] = random_array()?;

    let mut cert = Certificate {
        id: Uuid::new_v4().to_string(),
        device_id: device.id.clone(),
        fingerprint: fingerprint(&public_key),
        public_key,
        issued_at: now,
        expires_at: now + Duration::days(i64::from(validity_days)),
        issuer: name.clone(),
        subject: name,
        serial_number: hex::encode(serial),
        signature: Vec::new(),
        verified: false,
    };
    cert.signature = identity.keys().sign(&cert.signed_bytes()).to_vec();
    Ok(cert)
}

/// Validity check against the current time. Never errors.
pub fn verify_certificate(cert: &Certificate) -> bool {
    verify_certificate_at(cert, Utc::now())
}

pub fn verify_certificate_at(cert: &Certificate, now: DateTime<Utc>) -> bool {
    if cert.is_expired_at(now) {
        debug!(cert_id = %cert.id, "Certificate expired");
        return false;
    }
    if fingerprint(&cert.public_key) != cert.fingerprint {
        debug!(cert_id = %cert.id, "Certificate fingerprint mismatch");
        return false;
    }
    if verify_signature(&cert.public_key, &cert.signed_bytes(), &cert.signature).is_err() {
        debug!(cert_id = %cert.id, "Certificate signature invalid");
        return false;
    }
    true
}

// ============================================================================
// PEM framing
// ============================================================================

pub fn export_to_pem(cert: &Certificate) -> Result<String> {
    let json = serde_json::to_vec(cert)?;
    let encoded = STANDARD.encode(json);

    let mut pem = String::with_capacity(encoded.len() + encoded.len() / PEM_LINE_WIDTH + 96);
    pem.push_str(PEM_HEADER);
    pem.push('\n');
    let mut start = 0;
    while start < encoded.len() {
        let end = (start + PEM_LINE_WIDTH).min(encoded.len());
        pem.push_str(&encoded[start..end]);
        pem.push('\n');
        start = end;
    }
    pem.push_str(PEM_FOOTER);
    pem.push('\n');
    Ok(pem)
}

/// Parse PEM framing and schema. The result is never verified or trusted.
pub fn import_from_pem(text: &str) -> Result<Certificate> {
    let text = text.trim();
    let body = text
        .strip_prefix(PEM_HEADER)
        .and_then(|rest| rest.strip_suffix(PEM_FOOTER))
        .ok_or_else(|| CoreError::InvalidPayload("missing certificate PEM markers".into()))?;

    let encoded: String = body.split_whitespace().collect();
    if encoded.is_empty() {
        return Err(CoreError::InvalidPayload("empty certificate PEM body".into()));
    }
    let json = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| CoreError::InvalidPayload(format!("certificate base64: {e}")))?;

    let mut cert: Certificate = serde_json::from_slice(&json)?;
    cert.verified = false;
    Ok(cert)
}

// ============================================================================
// Certificate Service
// ============================================================================

#[derive(Clone, Default)]
struct TrustStore {
    by_id: HashMap<String, Certificate>,
    by_device: HashMap<String, String>,
    by_fingerprint: HashMap<String, String>,
    trusted: HashSet<String>,
}

impl TrustStore {
    /// Index `cert`, replacing any previous certificate for the same device.
    /// `verified` is taken from the trusted set, never from the caller.
    ///
    /// Certificate ids and keys are chosen by the peer, so an id or
    /// fingerprint already held by another device is refused.
    fn insert(&mut self, mut cert: Certificate) -> Result<()> {
        if let Some(existing) = self.by_id.get(&cert.id) {
            if existing.device_id != cert.device_id || existing.fingerprint != cert.fingerprint {
                return Err(CoreError::Trust(format!(
                    "certificate id {} is already bound to device {}",
                    cert.id, existing.device_id
                )));
            }
        }
        if let Some(owner) = self
            .by_fingerprint
            .get(&cert.fingerprint)
            .and_then(|id| self.by_id.get(id))
        {
            if owner.device_id != cert.device_id {
                return Err(CoreError::Trust(format!(
                    "fingerprint {} is already bound to device {}",
                    cert.fingerprint, owner.device_id
                )));
            }
        }

        if let Some(old_id) = self.by_device.get(&cert.device_id).cloned() {
            if old_id != cert.id {
                self.remove(&old_id);
            }
        }
        cert.verified = self.trusted.contains(&cert.fingerprint);
        self.by_device.insert(cert.device_id.clone(), cert.id.clone());
        self.by_fingerprint.insert(cert.fingerprint.clone(), cert.id.clone());
        self.by_id.insert(cert.id.clone(), cert);
        Ok(())
    }

    fn remove(&mut self, cert_id: &str) -> Option<Certificate> {
        let cert = self.by_id.remove(cert_id)?;
        if self.by_device.get(&cert.device_id).map(String::as_str) == Some(cert_id) {
            self.by_device.remove(&cert.device_id);
        }
        if self.by_fingerprint.get(&cert.fingerprint).map(String::as_str) == Some(cert_id) {
            self.by_fingerprint.remove(&cert.fingerprint);
        }
        self.untrust(&cert.fingerprint);
        Some(cert)
    }

    fn trust(&mut self, fp: &str) {
        self.trusted.insert(fp.to_string());
        for cert in self.by_id.values_mut().filter(|c| c.fingerprint == fp) {
            cert.verified = true;
        }
    }

    fn untrust(&mut self, fp: &str) -> bool {
        let was_trusted = self.trusted.remove(fp);
        for cert in self.by_id.values_mut().filter(|c| c.fingerprint == fp) {
            cert.verified = false;
        }
        was_trusted
    }

    fn snapshot(&self) -> (Vec<Certificate>, Vec<String>) {
        let mut certs: Vec<Certificate> = self.by_id.values().cloned().collect();
        certs.sort_by(|a, b| a.issued_at.cmp(&b.issued_at).then_with(|| a.id.cmp(&b.id)));
        let mut trusted: Vec<String> = self.trusted.iter().cloned().collect();
        trusted.sort();
        (certs, trusted)
    }
}

/// Owns certificates and the trusted fingerprint set.
pub struct CertificateService {
    store: Arc<dyn KeyValueStore>,
    state: RwLock<TrustStore>,
    validity_days: u32,
}

impl CertificateService {
    /// Empty service; nothing is read from `store` until [`Self::load`].
    pub fn new(store: Arc<dyn KeyValueStore>, validity_days: u32) -> Self {
        Self {
            store,
            state: RwLock::new(TrustStore::default()),
            validity_days,
        }
    }

    /// Service restored from the persisted certificates and trust set.
    pub async fn load(store: Arc<dyn KeyValueStore>, validity_days: u32) -> Result<Self> {
        let certs: Vec<Certificate> = load_json(store.as_ref(), CERTIFICATES_KEY)
            .await?
            .unwrap_or_default();
        let trusted: Vec<String> = load_json(store.as_ref(), TRUSTED_FINGERPRINTS_KEY)
            .await?
            .unwrap_or_default();

        let mut state = TrustStore::default();
        state.trusted = trusted.into_iter().collect();
        for cert in certs {
            let cert_id = cert.id.clone();
            if let Err(e) = state.insert(cert) {
                warn!(cert_id = %cert_id, error = %e, "Skipping conflicting stored certificate");
            }
        }
        debug!(
            certificates = state.by_id.len(),
            trusted = state.trusted.len(),
            "Loaded trust store"
        );

        Ok(Self {
            store,
            state: RwLock::new(state),
            validity_days,
        })
    }

    pub fn validity_days(&self) -> u32 {
        self.validity_days
    }

    async fn persist(&self, state: &TrustStore) -> Result<()> {
        let (certs, trusted) = state.snapshot();
        save_json(self.store.as_ref(), CERTIFICATES_KEY, &certs).await?;
        save_json(self.store.as_ref(), TRUSTED_FINGERPRINTS_KEY, &trusted).await?;
        Ok(())
    }

    /// Persist `next` and only then make it the live state. On failure the
    /// live state is untouched and the previous snapshot is written back.
    async fn commit(&self, state: &mut TrustStore, next: TrustStore) -> Result<()> {
        if let Err(e) = self.persist(&next).await {
            if let Err(restore_err) = self.persist(state).await {
                warn!(error = %restore_err, "Failed to restore persisted trust store");
            }
            return Err(e);
        }
        *state = next;
        Ok(())
    }

    /// The local device's certificate: the stored one while it is still
    /// valid for the current key, otherwise a freshly issued one.
    pub async fn local_certificate(&self, identity: &LocalIdentity) -> Result<Certificate> {
        let mut state = self.state.write().await;
        let existing = state
            .by_device
            .get(identity.device_id())
            .and_then(|id| state.by_id.get(id));
        if let Some(cert) = existing {
            if cert.public_key == identity.device.public_key && verify_certificate(cert) {
                return Ok(cert.clone());
            }
        }

        let cert = generate_certificate(identity, self.validity_days)?;
        let mut next = state.clone();
        next.insert(cert.clone())?;
        self.commit(&mut state, next).await?;
        info!(
            cert_id = %cert.id,
            device_id = %cert.device_id,
            expires_at = %cert.expires_at,
            "Issued local certificate"
        );
        Ok(cert)
    }

    /// Index a certificate without trusting it. Replaces any earlier
    /// certificate for the same device, along with that certificate's trust.
    pub async fn store_certificate(&self, cert: Certificate) -> Result<()> {
        let mut state = self.state.write().await;
        debug!(cert_id = %cert.id, device_id = %cert.device_id, "Storing certificate");
        let mut next = state.clone();
        next.insert(cert)?;
        self.commit(&mut state, next).await
    }

    /// Mark a valid certificate as trusted and index it.
    pub async fn trust_certificate(&self, cert: &Certificate) -> Result<Certificate> {
        self.trust_certificate_at(cert, Utc::now()).await
    }

    pub async fn trust_certificate_at(
        &self,
        cert: &Certificate,
        now: DateTime<Utc>,
    ) -> Result<Certificate> {
        if !verify_certificate_at(cert, now) {
            warn!(
                cert_id = %cert.id,
                device_id = %cert.device_id,
                "Refusing to trust invalid certificate"
            );
            return Err(CoreError::Trust(format!(
                "certificate {} failed verification",
                cert.id
            )));
        }

        let mut state = self.state.write().await;
        let mut next = state.clone();
        next.insert(cert.clone())?;
        next.trust(&cert.fingerprint);
        self.commit(&mut state, next).await?;

        let mut trusted = cert.clone();
        trusted.verified = true;

        info!(
            cert_id = %trusted.id,
            device_id = %trusted.device_id,
            fingerprint = %trusted.fingerprint,
            "Certificate trusted"
        );
        Ok(trusted)
    }

    /// Revoke trust for a certificate. Unknown ids are a no-op.
    pub async fn revoke_trust(&self, cert_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let Some(fp) = state.by_id.get(cert_id).map(|c| c.fingerprint.clone()) else {
            return Ok(());
        };
        let mut next = state.clone();
        let was_trusted = next.untrust(&fp);
        self.commit(&mut state, next).await?;
        if was_trusted {
            info!(cert_id = %cert_id, fingerprint = %fp, "Certificate trust revoked");
        }
        Ok(())
    }

    pub async fn is_trusted(&self, fingerprint: &str) -> bool {
        self.state.read().await.trusted.contains(fingerprint)
    }

    pub async fn get_certificate(&self, cert_id: &str) -> Option<Certificate> {
        self.state.read().await.by_id.get(cert_id).cloned()
    }

    pub async fn get_certificate_by_device(&self, device_id: &str) -> Option<Certificate> {
        let state = self.state.read().await;
        state
            .by_device
            .get(device_id)
            .and_then(|id| state.by_id.get(id))
            .cloned()
    }

    pub async fn get_certificate_by_fingerprint(&self, fp: &str) -> Option<Certificate> {
        let state = self.state.read().await;
        state
            .by_fingerprint
            .get(fp)
            .and_then(|id| state.by_id.get(id))
            .cloned()
    }

    pub async fn list_certificates(&self) -> Vec<Certificate> {
        self.state.read().await.snapshot().0
    }

    pub async fn list_trusted(&self) -> Vec<Certificate> {
        let state = self.state.read().await;
        let mut certs: Vec<Certificate> = state
            .by_id
            .values()
            .filter(|c| state.trusted.contains(&c.fingerprint))
            .cloned()
            .collect();
        certs.sort_by(|a, b| a.issued_at.cmp(&b.issued_at).then_with(|| a.id.cmp(&b.id)));
        certs
    }

    /// Drop every expired certificate and its trust entry.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.cleanup_expired_at(Utc::now()).await
    }

    pub async fn cleanup_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().await;
        let expired: Vec<String> = state
            .by_id
            .values()
            .filter(|c| c.is_expired_at(now))
            .map(|c| c.id.clone())
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        let mut next = state.clone();
        for id in &expired {
            next.remove(id);
        }
        self.commit(&mut state, next).await?;
        info!(removed = expired.len(), "Removed expired certificates");
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FailingStore, InMemoryStore};
    use crate::types::Platform;

    fn identity(name: &str) -> LocalIdentity {
        LocalIdentity::generate(name, Platform::Linux)
    }

    fn service() -> (Arc<InMemoryStore>, CertificateService) {
        let store = InMemoryStore::new_shared();
        let svc = CertificateService::new(store.clone(), DEFAULT_VALIDITY_DAYS);
        (store, svc)
    }

    #[test]
    fn test_fresh_certificate_verifies() {
        let id = identity("laptop");
        let cert = generate_certificate(&id, 365).unwrap();
        assert!(verify_certificate(&cert));
        assert_eq!(cert.fingerprint, id.fingerprint());
        assert_eq!(cert.issuer, cert.subject);
        assert_eq!(cert.serial_number.len(), 32);
        assert!(!cert.verified);
    }

    #[test]
    fn test_expired_certificate_fails() {
        let id = identity("laptop");
        let cert = generate_certificate(&id, 1).unwrap();
        assert!(!verify_certificate_at(&cert, cert.expires_at + Duration::seconds(1)));

        let mut forced = cert.clone();
        forced.expires_at = Utc::now() - Duration::days(1);
        assert!(!verify_certificate(&forced));
    }

    #[test]
    fn test_tampered_fields_fail() {
        let id = identity("laptop");
        let cert = generate_certificate(&id, 30).unwrap();

        let mut renamed = cert.clone();
        renamed.subject = "CN=mallory".into();
        assert!(!verify_certificate(&renamed));

        let mut rekeyed = cert.clone();
        let other = identity("mallory");
        rekeyed.public_key = other.device.public_key.clone();
        assert!(!verify_certificate(&rekeyed));

        // Consistent fingerprint but the signature is still over the old key.
        rekeyed.fingerprint = other.fingerprint();
        assert!(!verify_certificate(&rekeyed));

        let mut extended = cert;
        extended.expires_at += Duration::days(3650);
        assert!(!verify_certificate(&extended));
    }

    #[test]
    fn test_zero_validity_rejected() {
        let id = identity("laptop");
        assert!(matches!(generate_certificate(&id, 0), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_pem_round_trip_and_framing() {
        let id = identity("laptop");
        let cert = generate_certificate(&id, 30).unwrap();
        let pem = export_to_pem(&cert).unwrap();

        assert!(pem.starts_with(PEM_HEADER));
        assert!(pem.trim_end().ends_with(PEM_FOOTER));
        assert!(pem.lines().all(|l| l.len() <= PEM_LINE_WIDTH || l.starts_with("-----")));

        let imported = import_from_pem(&pem).unwrap();
        assert_eq!(imported, cert);
        assert!(verify_certificate(&imported));
    }

    #[test]
    fn test_pem_import_rejects_garbage_and_never_trusts() {
        assert!(matches!(import_from_pem("hello"), Err(CoreError::InvalidPayload(_))));
        let bad = format!("{PEM_HEADER}\n!!!!\n{PEM_FOOTER}");
        assert!(matches!(import_from_pem(&bad), Err(CoreError::InvalidPayload(_))));

        let id = identity("laptop");
        let mut cert = generate_certificate(&id, 30).unwrap();
        cert.verified = true;
        let imported = import_from_pem(&export_to_pem(&cert).unwrap()).unwrap();
        assert!(!imported.verified);
    }

    #[tokio::test]
    async fn test_trust_and_revoke() {
        let (_, svc) = service();
        let cert = generate_certificate(&identity("phone"), 30).unwrap();

        let trusted = svc.trust_certificate(&cert).await.unwrap();
        assert!(trusted.verified);
        assert!(svc.is_trusted(&cert.fingerprint).await);
        assert_eq!(svc.list_trusted().await.len(), 1);

        svc.revoke_trust(&cert.id).await.unwrap();
        svc.revoke_trust(&cert.id).await.unwrap();
        svc.revoke_trust("unknown").await.unwrap();
        assert!(!svc.is_trusted(&cert.fingerprint).await);
        assert!(!svc.get_certificate(&cert.id).await.unwrap().verified);
    }

    #[tokio::test]
    async fn test_trust_invalid_leaves_set_unchanged() {
        let (_, svc) = service();
        let good = generate_certificate(&identity("phone"), 30).unwrap();
        svc.trust_certificate(&good).await.unwrap();

        let mut bad = generate_certificate(&identity("tablet"), 30).unwrap();
        bad.signature[0] ^= 0xff;
        let err = svc.trust_certificate(&bad).await.unwrap_err();
        assert!(matches!(err, CoreError::Trust(_)));

        let trusted = svc.list_trusted().await;
        assert_eq!(trusted.len(), 1);
        assert_eq!(trusted[0].id, good.id);
        assert!(!svc.is_trusted(&bad.fingerprint).await);
        assert!(svc.get_certificate(&bad.id).await.is_none());
    }

    #[tokio::test]
    async fn test_lookups() {
        let (_, svc) = service();
        let cert = generate_certificate(&identity("phone"), 30).unwrap();
        svc.store_certificate(cert.clone()).await.unwrap();

        assert_eq!(svc.get_certificate(&cert.id).await.unwrap().id, cert.id);
        assert_eq!(svc.get_certificate_by_device(&cert.device_id).await.unwrap().id, cert.id);
        assert_eq!(
            svc.get_certificate_by_fingerprint(&cert.fingerprint).await.unwrap().id,
            cert.id
        );
        assert_eq!(svc.list_certificates().await.len(), 1);
        assert!(svc.list_trusted().await.is_empty());
    }

    #[tokio::test]
    async fn test_last_write_wins_per_device() {
        let (_, svc) = service();
        let id = identity("phone");
        let first = generate_certificate(&id, 30).unwrap();
        svc.trust_certificate(&first).await.unwrap();

        let second = generate_certificate(&id, 60).unwrap();
        svc.store_certificate(second.clone()).await.unwrap();

        assert!(svc.get_certificate(&first.id).await.is_none());
        assert_eq!(svc.get_certificate_by_device(id.device_id()).await.unwrap().id, second.id);
        assert_eq!(svc.list_certificates().await.len(), 1);
        // Same key, so the fingerprint index now points at the new certificate.
        assert_eq!(
            svc.get_certificate_by_fingerprint(&second.fingerprint).await.unwrap().id,
            second.id
        );
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let (_, svc) = service();
        let short = generate_certificate(&identity("old"), 1).unwrap();
        let long = generate_certificate(&identity("new"), 30).unwrap();
        svc.trust_certificate(&short).await.unwrap();
        svc.trust_certificate(&long).await.unwrap();

        let later = Utc::now() + Duration::days(2);
        assert_eq!(svc.cleanup_expired_at(later).await.unwrap(), 1);
        assert!(!svc.is_trusted(&short.fingerprint).await);
        assert!(svc.is_trusted(&long.fingerprint).await);
        assert_eq!(svc.cleanup_expired_at(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_local_certificate_reused() {
        let (_, svc) = service();
        let id = identity("desk");
        let a = svc.local_certificate(&id).await.unwrap();
        let b = svc.local_certificate(&id).await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_reused_certificate_id_cannot_displace_another_device() {
        let (_, svc) = service();
        let victim = generate_certificate(&identity("victim"), 30).unwrap();
        svc.trust_certificate(&victim).await.unwrap();

        let attacker = identity("attacker");
        let mut forged = generate_certificate(&attacker, 30).unwrap();
        forged.id = victim.id.clone();
        forged.signature = attacker.keys().sign(&forged.signed_bytes()).to_vec();
        assert!(verify_certificate(&forged));

        assert!(matches!(
            svc.trust_certificate(&forged).await,
            Err(CoreError::Trust(_))
        ));
        assert!(matches!(
            svc.store_certificate(forged.clone()).await,
            Err(CoreError::Trust(_))
        ));
        assert!(!svc.is_trusted(&forged.fingerprint).await);
        assert_eq!(
            svc.get_certificate(&victim.id).await.unwrap().fingerprint,
            victim.fingerprint
        );

        svc.revoke_trust(&victim.id).await.unwrap();
        assert!(!svc.is_trusted(&victim.fingerprint).await);
    }

    #[tokio::test]
    async fn test_key_already_owned_by_another_device_rejected() {
        let (_, svc) = service();
        let owner = identity("owner");
        let original = generate_certificate(&owner, 30).unwrap();
        svc.trust_certificate(&original).await.unwrap();

        let mut clone = owner.clone();
        clone.device.id = "someone-else".into();
        let claimed = generate_certificate(&clone, 30).unwrap();
        assert!(matches!(
            svc.trust_certificate(&claimed).await,
            Err(CoreError::Trust(_))
        ));
        assert_eq!(svc.list_certificates().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_trust_unchanged() {
        let store = FailingStore::new_shared();
        let svc = CertificateService::new(store.clone(), DEFAULT_VALIDITY_DAYS);
        let kept = generate_certificate(&identity("kept"), 30).unwrap();
        svc.trust_certificate(&kept).await.unwrap();

        store.fail_writes_to(Some(TRUSTED_FINGERPRINTS_KEY));
        let fresh = generate_certificate(&identity("fresh"), 30).unwrap();
        assert!(matches!(
            svc.trust_certificate(&fresh).await,
            Err(CoreError::Store(_))
        ));
        assert!(!svc.is_trusted(&fresh.fingerprint).await);
        assert!(svc.get_certificate(&fresh.id).await.is_none());

        assert!(svc.revoke_trust(&kept.id).await.is_err());
        assert!(svc.is_trusted(&kept.fingerprint).await);

        store.fail_writes_to(None);
        let reloaded = CertificateService::load(store, DEFAULT_VALIDITY_DAYS).await.unwrap();
        assert!(reloaded.is_trusted(&kept.fingerprint).await);
        assert!(reloaded.get_certificate(&fresh.id).await.is_none());
        assert_eq!(reloaded.list_certificates().await.len(), 1);
    }

    #[tokio::test]
    async fn test_persisted_state_reloads() {
        let (store, svc) = service();
        let trusted = generate_certificate(&identity("phone"), 30).unwrap();
        let plain = generate_certificate(&identity("tv"), 30).unwrap();
        svc.trust_certificate(&trusted).await.unwrap();
        svc.store_certificate(plain.clone()).await.unwrap();

        let reloaded = CertificateService::load(store, DEFAULT_VALIDITY_DAYS).await.unwrap();
        assert!(reloaded.is_trusted(&trusted.fingerprint).await);
        assert!(!reloaded.is_trusted(&plain.fingerprint).await);
        assert!(reloaded.get_certificate(&trusted.id).await.unwrap().verified);
        assert_eq!(reloaded.list_certificates().await.len(), 2);
    }
}
