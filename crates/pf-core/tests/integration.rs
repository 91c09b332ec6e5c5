//! Integration tests for Portal Fusion pairing and trust.
//!
//! Two devices run in-process, each with its own store, and hand pairing
//! messages to each other directly.

use std::sync::Arc;

use pf_core::{
    certificate::{generate_certificate, verify_certificate},
    config::CoreConfig,
    harness::{in_memory_core, pair_with_pin, run_pairing_flow},
    pairing::PairingState,
    store::{InMemoryStore, JsonFileStore, KeyValueStore},
    types::{LocalIdentity, Platform},
    CoreError, PortalCore, SecureChannel,
};

async fn device(name: &str) -> PortalCore {
    in_memory_core(name, CoreConfig::default()).await.unwrap()
}

fn wrong_pin(pin: &str) -> String {
    pin.chars()
        .map(|c| if c == '0' { '1' } else { '0' })
        .collect()
}

/// Test: both sides end up paired, trusting each other, with equal keys
#[tokio::test]
async fn integration_pairing_flow() {
    let laptop = device("laptop").await;
    let phone = device("phone").await;

    let (k_laptop, k_phone) = run_pairing_flow(&laptop, &phone)
        .await
        .expect("pairing flow should succeed");
    assert_eq!(k_laptop.key().as_bytes(), k_phone.key().as_bytes());

    let laptop_id = laptop.identity().device_id().to_string();
    let phone_id = phone.identity().device_id().to_string();
    assert!(laptop.pairing().is_paired(&phone_id).await);
    assert!(phone.pairing().is_paired(&laptop_id).await);

    assert!(laptop.certificates().is_trusted(&phone.identity().fingerprint()).await);
    assert!(phone.certificates().is_trusted(&laptop.identity().fingerprint()).await);

    let paired = laptop.pairing().get_paired_devices().await;
    assert_eq!(paired.len(), 1);
    assert_eq!(paired[0].device.name, "phone");
}

/// Test: a wrong PIN never reaches Verified and nothing is trusted
#[tokio::test]
async fn integration_wrong_pin_never_verifies() {
    let laptop = device("laptop").await;
    let phone = device("phone").await;

    let a = laptop.pairing();
    let b = phone.pairing();
    let initiation = a.initiate().await.unwrap();
    let response = b.join(&initiation.payload).await.unwrap();
    a.accept_join(&response).await.unwrap();

    let bad = wrong_pin(&initiation.pin);
    let max = laptop.config().pairing.max_pin_attempts;
    for attempt in 1..=max {
        let challenge = b.verify_pin(&initiation.session_id, &bad).await.unwrap();
        let err = a.verify_pin_challenge(&challenge).await.unwrap_err();
        assert!(matches!(err, CoreError::Authentication(_)), "attempt {attempt}: {err}");
        assert_ne!(
            a.session_state(&initiation.session_id).await.unwrap(),
            PairingState::Verified
        );
    }

    assert_eq!(
        a.session_state(&initiation.session_id).await.unwrap(),
        PairingState::Cancelled
    );
    assert!(matches!(
        a.complete(&initiation.session_id).await,
        Err(CoreError::InvalidState(_))
    ));
    assert!(laptop.certificates().list_trusted().await.is_empty());
    assert!(a.get_paired_devices().await.is_empty());
}

/// Test: the harness surfaces a wrong PIN as an authentication failure
#[tokio::test]
async fn integration_harness_wrong_pin() {
    let laptop = device("laptop").await;
    let phone = device("phone").await;
    let result = pair_with_pin(&laptop, &phone, Some("0000000")).await;
    assert!(matches!(result, Err(CoreError::Authentication(_))));
}

/// Test: unpairing revokes trust on that side only
#[tokio::test]
async fn integration_unpair_revokes_trust() {
    let laptop = device("laptop").await;
    let phone = device("phone").await;
    run_pairing_flow(&laptop, &phone).await.unwrap();

    let phone_id = phone.identity().device_id().to_string();
    assert!(laptop.pairing().unpair(&phone_id).await.unwrap());
    assert!(!laptop.pairing().unpair(&phone_id).await.unwrap());

    assert!(!laptop.certificates().is_trusted(&phone.identity().fingerprint()).await);
    assert!(!laptop.pairing().is_paired(&phone_id).await);
    assert!(phone.certificates().is_trusted(&laptop.identity().fingerprint()).await);
}

/// Test: an invalid certificate leaves the trusted set unchanged
#[tokio::test]
async fn integration_invalid_certificate_not_trusted() {
    let laptop = device("laptop").await;
    let stranger = LocalIdentity::generate("stranger", Platform::Linux);

    let mut forged = generate_certificate(&stranger, 30).unwrap();
    forged.subject = "someone else".into();
    assert!(!verify_certificate(&forged));

    let before = laptop.certificates().list_trusted().await;
    let err = laptop.certificates().trust_certificate(&forged).await.unwrap_err();
    assert!(matches!(err, CoreError::Trust(_)));
    assert_eq!(laptop.certificates().list_trusted().await, before);
    assert!(!laptop.certificates().is_trusted(&forged.fingerprint).await);
}

/// Test: the session keys protect traffic in both directions
#[tokio::test]
async fn integration_secure_channel_after_pairing() {
    let laptop = device("laptop").await;
    let phone = device("phone").await;
    let (k_laptop, k_phone) = run_pairing_flow(&laptop, &phone).await.unwrap();

    let to_phone = SecureChannel::new(k_laptop);
    let to_laptop = SecureChannel::new(k_phone);
    assert_eq!(to_phone.peer_device_id(), phone.identity().device_id());

    let sealed = to_phone.seal(b"clipboard: hello").unwrap();
    assert_eq!(to_laptop.open(&sealed).unwrap(), b"clipboard: hello");

    let reply = to_laptop.seal(b"ack").unwrap();
    assert_eq!(to_phone.open(&reply).unwrap(), b"ack");
    assert!(to_laptop.open(&reply).is_err());
}

/// Test: paired devices and trust survive a restart on disk
#[tokio::test]
async fn integration_pairing_persists_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("laptop.json");

    let phone = device("phone").await;
    let phone_id = phone.identity().device_id().to_string();
    {
        let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::open(&path).await.unwrap());
        let laptop = PortalCore::open(CoreConfig::default(), store, "laptop").await.unwrap();
        run_pairing_flow(&laptop, &phone).await.unwrap();
    }

    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::open(&path).await.unwrap());
    let laptop = PortalCore::open(CoreConfig::default(), store, "laptop").await.unwrap();
    assert!(laptop.pairing().is_paired(&phone_id).await);
    assert!(laptop.certificates().is_trusted(&phone.identity().fingerprint()).await);
}

/// Test: two devices sharing nothing but the pairing exchange can pair
/// repeatedly; re-pairing replaces the old record
#[tokio::test]
async fn integration_repairing_replaces_record() {
    let laptop = device("laptop").await;
    let phone = device("phone").await;
    run_pairing_flow(&laptop, &phone).await.unwrap();
    run_pairing_flow(&laptop, &phone).await.unwrap();
    assert_eq!(laptop.pairing().get_paired_devices().await.len(), 1);
    assert_eq!(laptop.certificates().list_trusted().await.len(), 1);
}

/// Test: a stale store entry for the paired list is reported, not ignored
#[tokio::test]
async fn integration_corrupt_paired_list_rejected() {
    let store = InMemoryStore::new_shared();
    store
        .set("paired_devices", "not json".to_string())
        .await
        .unwrap();
    let store: Arc<dyn KeyValueStore> = store;
    let result = PortalCore::open(CoreConfig::default(), store, "laptop").await;
    assert!(result.is_err());
}
