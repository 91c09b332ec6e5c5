//! Helpers that drive two in-process devices through pairing.
//!
//! Used by the integration tests and the CLI demo; there is no transport,
//! messages are handed across directly.

use std::sync::Arc;

use tracing::debug;

use crate::channel::SessionKey;
use crate::config::CoreConfig;
use crate::errors::Result;
use crate::node::PortalCore;
use crate::store::{InMemoryStore, KeyValueStore};

/// A device backed by a fresh in-memory store.
pub async fn in_memory_core(name: &str, config: CoreConfig) -> Result<PortalCore> {
    let store: Arc<dyn KeyValueStore> = InMemoryStore::new_shared();
    PortalCore::open(config, store, name).await
}

/// Pair `initiator` with `responder`, the responder typing `entered_pin`
/// (or the real PIN when `None`).
///
/// Returns the initiator's and responder's session keys.
pub async fn pair_with_pin(
    initiator: &PortalCore,
    responder: &PortalCore,
    entered_pin: Option<&str>,
) -> Result<(SessionKey, SessionKey)> {
    let a = initiator.pairing();
    let b = responder.pairing();

    let initiation = a.initiate().await?;
    debug!(session_id = %initiation.session_id, "harness: invitation issued");

    let response = b.join(&initiation.payload).await?;
    a.accept_join(&response).await?;

    let pin = entered_pin.unwrap_or(&initiation.pin);
    let challenge = b.verify_pin(&initiation.session_id, pin).await?;
    let confirmation = a.verify_pin_challenge(&challenge).await?;
    b.confirm_pin(&confirmation).await?;

    let initiator_key = a.complete(&initiation.session_id).await?;
    let responder_key = b.complete(&initiation.session_id).await?;
    Ok((initiator_key, responder_key))
}

/// Full happy-path pairing.
pub async fn run_pairing_flow(
    initiator: &PortalCore,
    responder: &PortalCore,
) -> Result<(SessionKey, SessionKey)> {
    pair_with_pin(initiator, responder, None).await
}
