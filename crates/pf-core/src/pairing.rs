//! Pairing state machine.
//!
//! Two devices establish mutual trust through a short-lived session:
//!
//! ```text
//! initiator                                  responder
//! ---------                                  ---------
//! initiate()        -- Invitation (QR) -->   join()
//! accept_join()     <-- JoinResponse ---
//!                                            verify_pin(pin)
//! verify_pin_challenge() <-- PinChallenge --
//!                   -- PinConfirmation -->   confirm_pin()
//! complete()                                 complete()
//! ```
//!
//! The PIN is shown only on the initiator and typed on the responder. It
//! never crosses the wire. It keys a SPAKE2 exchange whose messages ride
//! in the invitation and the challenge; the PAKE secret is mixed with the
//! ECDH secret to key both proofs and the session key. Someone who swaps
//! a key share or a PAKE message gets one online guess at the PIN and no
//! transcript to search offline.
//!
//! Wrong PIN proofs are charged against the `pairing.pin` rule of the
//! shared [`RateLimiter`]; once that budget is gone the session is
//! cancelled.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use pf_crypto::kdf::SALT_LEN;
use pf_crypto::random::random_array;
use pf_crypto::transcript::Transcript;
use pf_crypto::{
    constant_time_compare, derive_session_key, generate_hmac, generate_pin, pake_respond,
    EcdhKeyPair, PakeInitiator, PakeKey, SharedSecret, SymmetricKey,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::certificate::{verify_certificate_at, Certificate, CertificateService};
use crate::channel::SessionKey;
use crate::config::PairingConfig;
use crate::errors::{CoreError, Result};
use crate::messages::{
    Invitation, JoinResponse, PairingMessage, PinChallenge, PinConfirmation, PROTOCOL_VERSION,
};
use crate::rate_limit::{
    RateLimiter, ACTION_PAIRING_ACCEPT, ACTION_PAIRING_CONFIRM, ACTION_PAIRING_INITIATE,
    ACTION_PAIRING_JOIN, ACTION_PAIRING_PIN, ACTION_PAIRING_VERIFY,
};
use crate::store::{load_json, save_json, KeyValueStore};
use crate::types::{Device, DeviceStatus, LocalIdentity};

pub const PAIRED_DEVICES_KEY: &str = "paired_devices";

const PIN_DOMAIN: &str = "pf_pairing_v2";
const PAKE_DOMAIN: &str = "pf_pake_v1";
const CONFIRM_KEY_DOMAIN: &str = "pf_pin_confirm_v1";
const SESSION_KEY_DOMAIN: &str = "pf_session_key_v2";
const INITIATOR_LABEL: &[u8] = b"initiator";
const RESPONDER_LABEL: &[u8] = b"responder";

/// Source of wall-clock time for session expiry.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    Initiated,
    AwaitingJoin,
    AwaitingPin,
    Verified,
    Completed,
    Cancelled,
}

impl PairingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PairingState::Completed | PairingState::Cancelled)
    }
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PairingState::Initiated => "initiated",
            PairingState::AwaitingJoin => "awaiting_join",
            PairingState::AwaitingPin => "awaiting_pin",
            PairingState::Verified => "verified",
            PairingState::Completed => "completed",
            PairingState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingRole {
    Initiator,
    Responder,
}

impl fmt::Display for PairingRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingRole::Initiator => f.write_str("initiator"),
            PairingRole::Responder => f.write_str("responder"),
        }
    }
}

/// Why a session ended in [`PairingState::Cancelled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Requested,
    Expired,
    PinAttemptsExhausted,
    PeerProofMismatch,
    TrustFailure,
    CompletionFailed,
}

/// A peer this device has completed pairing with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedDevice {
    pub device: Device,
    pub certificate_id: String,
    pub fingerprint: String,
    pub paired_at: DateTime<Utc>,
    pub session_id: String,
}

/// Secret-free view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub role: PairingRole,
    pub state: PairingState,
    pub peer_device_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub cancel_reason: Option<CancelReason>,
}

/// Returned by [`PairingManager::initiate`].
///
/// `payload` goes into the QR code; `pin` is shown on screen only.
pub struct Initiation {
    pub session_id: String,
    pub pin: String,
    pub payload: String,
    pub invitation: Invitation,
}

impl fmt::Debug for Initiation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Initiation")
            .field("session_id", &self.session_id)
            .field("pin", &"<redacted>")
            .field("expires_at", &self.invitation.expires_at)
            .finish()
    }
}

// ============================================================================
// Session
// ============================================================================

struct PairingSession {
    id: String,
    role: PairingRole,
    state: PairingState,
    salt: Vec<u8>,
    local_fingerprint: String,
    local_ecdh_public: [u8; 32],
    /// Initiator only, until the join response arrives.
    ecdh: Option<EcdhKeyPair>,
    /// Initiator only, until a challenge matches.
    pake: Option<PakeInitiator>,
    initiator_pake_message: Vec<u8>,
    responder_pake_message: Option<Vec<u8>>,
    /// Responder: candidate for the last PIN typed. Initiator: set once a
    /// challenge matches.
    pake_key: Option<PakeKey>,
    peer_device: Option<Device>,
    peer_certificate: Option<Certificate>,
    peer_ecdh_public: Option<[u8; 32]>,
    shared: Option<SharedSecret>,
    /// Initiator: the challenge it expects. Responder: the confirmation.
    expected_proof: Option<Zeroizing<[u8; 32]>>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    cancel_reason: Option<CancelReason>,
}

impl PairingSession {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn wipe(&mut self) {
        self.ecdh = None;
        self.pake = None;
        self.pake_key = None;
        self.shared = None;
        self.expected_proof = None;
    }

    fn cancel(&mut self, reason: CancelReason) {
        if !self.state.is_terminal() {
            self.state = PairingState::Cancelled;
            self.cancel_reason = Some(reason);
        }
        self.wipe();
    }

    /// Reject terminal sessions and expire stale ones.
    fn ensure_live(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.state {
            PairingState::Cancelled => {
                return Err(if self.cancel_reason == Some(CancelReason::Expired) {
                    CoreError::SessionExpired(self.id.clone())
                } else {
                    CoreError::InvalidState(format!("session {} was cancelled", self.id))
                });
            }
            PairingState::Completed => {
                return Err(CoreError::InvalidState(format!(
                    "session {} is already completed",
                    self.id
                )));
            }
            _ => {}
        }
        if self.is_expired_at(now) {
            self.cancel(CancelReason::Expired);
            info!(session_id = %self.id, role = %self.role, "Pairing session expired");
            return Err(CoreError::SessionExpired(self.id.clone()));
        }
        Ok(())
    }

    fn expect(&self, role: PairingRole, state: PairingState) -> Result<()> {
        if self.role != role || self.state != state {
            return Err(CoreError::InvalidState(format!(
                "session {} is {} as {}, operation needs {} as {}",
                self.id, self.state, self.role, state, role
            )));
        }
        Ok(())
    }

    fn peer_device_id(&self) -> Result<String> {
        self.peer_certificate
            .as_ref()
            .map(|c| c.device_id.clone())
            .ok_or_else(|| CoreError::InvalidState(format!("session {} has no peer yet", self.id)))
    }

    fn missing(&self, what: &str) -> CoreError {
        CoreError::InvalidState(format!("session {} has no {what}", self.id))
    }

    /// Transcript both sides build identically, regardless of role.
    fn handshake_transcript(&self) -> Result<Transcript> {
        let peer_fp = self
            .peer_certificate
            .as_ref()
            .map(|c| c.fingerprint.as_str())
            .ok_or_else(|| self.missing("peer certificate"))?;
        let peer_ecdh = self
            .peer_ecdh_public
            .ok_or_else(|| self.missing("peer key share"))?;

        let (i_ecdh, r_ecdh, i_fp, r_fp) = match self.role {
            PairingRole::Initiator => (
                self.local_ecdh_public,
                peer_ecdh,
                self.local_fingerprint.as_str(),
                peer_fp,
            ),
            PairingRole::Responder => (
                peer_ecdh,
                self.local_ecdh_public,
                peer_fp,
                self.local_fingerprint.as_str(),
            ),
        };

        let responder_pake = self
            .responder_pake_message
            .as_deref()
            .ok_or_else(|| self.missing("PAKE reply"))?;

        let mut t = Transcript::new(PIN_DOMAIN);
        t.append_str(1, &self.id)
            .append_bytes(2, &i_ecdh)
            .append_bytes(3, &r_ecdh)
            .append_str(4, i_fp)
            .append_str(5, r_fp)
            .append_bytes(6, &self.salt)
            .append_bytes(7, &self.initiator_pake_message)
            .append_bytes(8, responder_pake);
        Ok(t)
    }

    /// Key derived from both secrets and bound to the transcript.
    fn derive(&self, domain: &'static str) -> Result<SymmetricKey> {
        let shared = self.shared.as_ref().ok_or_else(|| self.missing("shared secret"))?;
        let pake_key = self.pake_key.as_ref().ok_or_else(|| self.missing("PAKE key"))?;
        let handshake = self.handshake_transcript()?;

        let mut ikm = Zeroizing::new(Vec::with_capacity(
            shared.as_bytes().len() + pake_key.as_bytes().len(),
        ));
        ikm.extend_from_slice(shared.as_bytes());
        ikm.extend_from_slice(pake_key.as_bytes());

        let mut info = Transcript::new(domain);
        info.append_str(1, &self.id)
            .append_bytes(2, &handshake.digest());
        Ok(derive_session_key(&ikm, &self.salt, info.as_bytes())?)
    }

    fn pin_proof(&self, label: &[u8]) -> Result<[u8; 32]> {
        let key = self.derive(CONFIRM_KEY_DOMAIN)?;
        let mut t = self.handshake_transcript()?;
        t.append_bytes(9, label);
        Ok(generate_hmac(t.as_bytes(), key.as_bytes())?)
    }

    fn session_key(&self) -> Result<SymmetricKey> {
        self.derive(SESSION_KEY_DOMAIN)
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            role: self.role,
            state: self.state,
            peer_device_id: self.peer_certificate.as_ref().map(|c| c.device_id.clone()),
            created_at: self.created_at,
            expires_at: self.expires_at,
            cancel_reason: self.cancel_reason,
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

type SessionHandle = Arc<Mutex<PairingSession>>;

/// Drives pairing sessions for the local device.
///
/// Each session sits behind its own mutex; the map lock is only held long
/// enough to clone a handle.
pub struct PairingManager {
    identity: LocalIdentity,
    certificates: Arc<CertificateService>,
    limiter: Arc<RateLimiter>,
    store: Arc<dyn KeyValueStore>,
    config: PairingConfig,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    paired: RwLock<HashMap<String, PairedDevice>>,
    clock: Clock,
}

impl PairingManager {
    /// Build a manager and load previously paired devices from `store`.
    ///
    /// The limiter must carry a rule for `pairing.pin`; it is the PIN
    /// attempt budget.
    pub async fn new(
        identity: LocalIdentity,
        certificates: Arc<CertificateService>,
        limiter: Arc<RateLimiter>,
        store: Arc<dyn KeyValueStore>,
        config: PairingConfig,
    ) -> Result<Self> {
        if !limiter.config().actions.contains_key(ACTION_PAIRING_PIN) {
            return Err(CoreError::Config(format!(
                "rate limiter has no '{ACTION_PAIRING_PIN}' rule"
            )));
        }
        if config.session_ttl_secs == 0 {
            return Err(CoreError::Config("session_ttl_secs must be greater than 0".into()));
        }

        let records: Vec<PairedDevice> =
            load_json(store.as_ref(), PAIRED_DEVICES_KEY).await?.unwrap_or_default();
        let paired = records
            .into_iter()
            .map(|r| (r.device.id.clone(), r))
            .collect::<HashMap<_, _>>();
        debug!(count = paired.len(), "Loaded paired devices");

        Ok(Self {
            identity,
            certificates,
            limiter,
            store,
            config,
            sessions: RwLock::new(HashMap::new()),
            paired: RwLock::new(paired),
            clock: system_clock(),
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn certificates(&self) -> &Arc<CertificateService> {
        &self.certificates
    }

    pub fn config(&self) -> &PairingConfig {
        &self.config
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn ttl(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(self.config.session_ttl())
            .map_err(|_| CoreError::Config("session_ttl_secs is out of range".into()))
    }

    async fn admit(&self, device_id: &str, action: &str) -> Result<()> {
        self.limiter
            .admit(device_id, Some(action))
            .await
            .into_result()
            .map(|_| ())
    }

    async fn session(&self, session_id: &str) -> Result<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))
    }

    fn pake_identities(session_id: &str) -> (String, String) {
        (
            format!("{PAKE_DOMAIN}:initiator:{session_id}"),
            format!("{PAKE_DOMAIN}:responder:{session_id}"),
        )
    }

    fn reject_self(&self, peer_id: &str) -> Result<()> {
        if peer_id == self.identity.device_id() {
            return Err(CoreError::InvalidPayload("cannot pair a device with itself".into()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Initiator
    // ------------------------------------------------------------------------

    /// Open a session and produce the invitation payload plus the PIN.
    pub async fn initiate(&self) -> Result<Initiation> {
        let local_id = self.identity.device_id().to_string();
        self.admit(&local_id, ACTION_PAIRING_INITIATE).await?;

        let certificate = self.certificates.local_certificate(&self.identity).await?;
        let ecdh = EcdhKeyPair::generate();
        let pin = Zeroizing::new(generate_pin(self.config.pin_digits)?);
        let salt = random_array::<SALT_LEN>()?.to_vec();
        let now = self.now();
        let expires_at = now + self.ttl()?;
        let session_id = Uuid::new_v4().to_string();
        let (id_a, id_b) = Self::pake_identities(&session_id);
        let pake = PakeInitiator::start(pin.as_bytes(), id_a.as_bytes(), id_b.as_bytes())?;

        let invitation = Invitation {
            version: PROTOCOL_VERSION,
            session_id: session_id.clone(),
            device: self.identity.device.clone(),
            certificate,
            ecdh_public: ecdh.public_key(),
            salt: salt.clone(),
            pake_message: pake.message().to_vec(),
            expires_at,
        };
        let payload = PairingMessage::Invitation(invitation.clone()).encode()?;
        let shown_pin = pin.as_str().to_string();

        let mut session = PairingSession {
            id: session_id.clone(),
            role: PairingRole::Initiator,
            state: PairingState::Initiated,
            salt,
            local_fingerprint: invitation.certificate.fingerprint.clone(),
            local_ecdh_public: invitation.ecdh_public,
            ecdh: Some(ecdh),
            pake: Some(pake),
            initiator_pake_message: invitation.pake_message.clone(),
            responder_pake_message: None,
            pake_key: None,
            peer_device: None,
            peer_certificate: None,
            peer_ecdh_public: None,
            shared: None,
            expected_proof: None,
            created_at: now,
            expires_at,
            cancel_reason: None,
        };
        session.state = PairingState::AwaitingJoin;

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), Arc::new(Mutex::new(session)));

        info!(
            session_id = %session_id,
            expires_at = %expires_at,
            "Pairing session initiated, awaiting join"
        );

        Ok(Initiation {
            session_id,
            pin: shown_pin,
            payload,
            invitation,
        })
    }

    /// Bind the responder's key share and certificate to the session.
    ///
    /// A response that fails validation is rejected without touching the
    /// session, so a forged response cannot kill a legitimate pairing.
    pub async fn accept_join(&self, response: &JoinResponse) -> Result<()> {
        response.validate()?;
        let handle = self.session(&response.session_id).await?;
        let mut session = handle.lock().await;
        let now = self.now();
        session.ensure_live(now)?;
        session.expect(PairingRole::Initiator, PairingState::AwaitingJoin)?;

        let peer_id = response.device.id.clone();
        self.reject_self(&peer_id)?;
        self.admit(&peer_id, ACTION_PAIRING_ACCEPT).await?;

        if !verify_certificate_at(&response.certificate, now) {
            warn!(session_id = %session.id, peer = %peer_id, "Responder certificate failed verification");
            return Err(CoreError::Trust(format!(
                "certificate {} from {} is not valid",
                response.certificate.id, peer_id
            )));
        }

        let shared = session
            .ecdh
            .as_ref()
            .ok_or_else(|| session.missing("key share"))?
            .shared_secret(&response.ecdh_public)?;

        session.peer_device = Some(response.device.clone());
        session.peer_certificate = Some(response.certificate.clone());
        session.peer_ecdh_public = Some(response.ecdh_public);
        session.shared = Some(shared);
        session.ecdh = None;
        session.state = PairingState::AwaitingPin;

        info!(session_id = %session.id, peer = %peer_id, "Responder joined, awaiting PIN");
        Ok(())
    }

    /// Finish the PAKE with the responder's reply and check its proof.
    ///
    /// On a match the session is verified and the confirmation for the
    /// responder is returned. Each mismatch, including a reply that is not
    /// a valid PAKE message, spends one unit of the peer's PIN budget.
    pub async fn verify_pin_challenge(&self, challenge: &PinChallenge) -> Result<PinConfirmation> {
        challenge.validate()?;
        let handle = self.session(&challenge.session_id).await?;
        let mut session = handle.lock().await;
        session.ensure_live(self.now())?;
        session.expect(PairingRole::Initiator, PairingState::AwaitingPin)?;

        let peer_id = session.peer_device_id()?;
        self.admit(&peer_id, ACTION_PAIRING_VERIFY).await?;

        let budget = self
            .limiter
            .check_action_at(&peer_id, ACTION_PAIRING_PIN, Instant::now())
            .await;
        if !budget.allowed {
            session.cancel(CancelReason::PinAttemptsExhausted);
            warn!(session_id = %session.id, peer = %peer_id, "PIN attempts exhausted, session cancelled");
            return Err(CoreError::Authentication(
                "PIN attempts exhausted, session cancelled".into(),
            ));
        }

        let candidate = session
            .pake
            .as_ref()
            .ok_or_else(|| session.missing("PAKE state"))?
            .finish(&challenge.pake_message);
        let matched = match candidate {
            Ok(key) => {
                session.responder_pake_message = Some(challenge.pake_message.clone());
                session.pake_key = Some(key);
                let expected = Zeroizing::new(session.pin_proof(RESPONDER_LABEL)?);
                constant_time_compare(expected.as_slice(), &challenge.proof)
            }
            Err(e) => {
                debug!(session_id = %session.id, error = %e, "Unusable PAKE reply");
                false
            }
        };

        if matched {
            let proof = session.pin_proof(INITIATOR_LABEL)?;
            session.pake = None;
            session.state = PairingState::Verified;
            info!(session_id = %session.id, peer = %peer_id, "PIN verified");
            return Ok(PinConfirmation {
                session_id: session.id.clone(),
                proof: proof.to_vec(),
            });
        }

        session.responder_pake_message = None;
        session.pake_key = None;

        let now = Instant::now();
        self.limiter
            .record_action_at(&peer_id, ACTION_PAIRING_PIN, now)
            .await;
        let budget = self
            .limiter
            .check_action_at(&peer_id, ACTION_PAIRING_PIN, now)
            .await;
        if !budget.allowed {
            session.cancel(CancelReason::PinAttemptsExhausted);
            warn!(session_id = %session.id, peer = %peer_id, "PIN mismatch, attempts exhausted, session cancelled");
            return Err(CoreError::Authentication(
                "PIN mismatch, attempts exhausted, session cancelled".into(),
            ));
        }

        warn!(
            session_id = %session.id,
            peer = %peer_id,
            remaining = budget.remaining,
            "PIN mismatch"
        );
        Err(CoreError::Authentication(format!(
            "PIN mismatch, {} attempt(s) remaining",
            budget.remaining
        )))
    }

    // ------------------------------------------------------------------------
    // Responder
    // ------------------------------------------------------------------------

    /// Join a session from a scanned invitation payload.
    pub async fn join(&self, payload: &str) -> Result<JoinResponse> {
        match PairingMessage::decode(payload)? {
            PairingMessage::Invitation(invitation) => self.join_invitation(invitation).await,
            other => Err(CoreError::InvalidPayload(format!(
                "expected an invitation, got {}",
                other.kind()
            ))),
        }
    }

    pub async fn join_invitation(&self, invitation: Invitation) -> Result<JoinResponse> {
        invitation.validate()?;
        let peer_id = invitation.device.id.clone();
        self.reject_self(&peer_id)?;
        self.admit(&peer_id, ACTION_PAIRING_JOIN).await?;

        let now = self.now();
        if now >= invitation.expires_at {
            debug!(session_id = %invitation.session_id, "Invitation already expired");
            return Err(CoreError::SessionExpired(invitation.session_id));
        }
        if !verify_certificate_at(&invitation.certificate, now) {
            warn!(session_id = %invitation.session_id, peer = %peer_id, "Initiator certificate failed verification");
            return Err(CoreError::Trust(format!(
                "certificate {} from {} is not valid",
                invitation.certificate.id, peer_id
            )));
        }

        let certificate = self.certificates.local_certificate(&self.identity).await?;
        let ecdh = EcdhKeyPair::generate();
        let shared = ecdh.shared_secret(&invitation.ecdh_public)?;
        let expires_at = invitation.expires_at.min(now + self.ttl()?);

        let session = PairingSession {
            id: invitation.session_id.clone(),
            role: PairingRole::Responder,
            state: PairingState::AwaitingPin,
            salt: invitation.salt,
            local_fingerprint: certificate.fingerprint.clone(),
            local_ecdh_public: ecdh.public_key(),
            ecdh: None,
            pake: None,
            initiator_pake_message: invitation.pake_message,
            responder_pake_message: None,
            pake_key: None,
            peer_device: Some(invitation.device),
            peer_certificate: Some(invitation.certificate),
            peer_ecdh_public: Some(invitation.ecdh_public),
            shared: Some(shared),
            expected_proof: None,
            created_at: now,
            expires_at,
            cancel_reason: None,
        };
        let response = JoinResponse {
            session_id: session.id.clone(),
            device: self.identity.device.clone(),
            certificate,
            ecdh_public: session.local_ecdh_public,
        };

        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&session.id) {
                return Err(CoreError::InvalidState(format!(
                    "session {} already exists",
                    session.id
                )));
            }
            sessions.insert(session.id.clone(), Arc::new(Mutex::new(session)));
        }

        info!(session_id = %response.session_id, peer = %peer_id, "Joined pairing session, awaiting PIN");
        Ok(response)
    }

    /// Prove knowledge of the PIN typed by the user.
    ///
    /// May be called again with a different PIN if the initiator rejected
    /// the previous challenge.
    pub async fn verify_pin(&self, session_id: &str, pin: &str) -> Result<PinChallenge> {
        let pin = pin.trim();
        if pin.is_empty() || !pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CoreError::InvalidPayload("PIN must be numeric".into()));
        }

        let handle = self.session(session_id).await?;
        let mut session = handle.lock().await;
        session.ensure_live(self.now())?;
        session.expect(PairingRole::Responder, PairingState::AwaitingPin)?;

        let peer_id = session.peer_device_id()?;
        self.admit(&peer_id, ACTION_PAIRING_VERIFY).await?;

        let (id_a, id_b) = Self::pake_identities(&session.id);
        let (reply, key) = pake_respond(
            pin.as_bytes(),
            id_a.as_bytes(),
            id_b.as_bytes(),
            &session.initiator_pake_message,
        )?;
        session.responder_pake_message = Some(reply.clone());
        session.pake_key = Some(key);

        let proof = session.pin_proof(RESPONDER_LABEL)?;
        let confirmation = session.pin_proof(INITIATOR_LABEL)?;
        session.expected_proof = Some(Zeroizing::new(confirmation));

        debug!(session_id = %session.id, "PIN challenge prepared");
        Ok(PinChallenge {
            session_id: session.id.clone(),
            pake_message: reply,
            proof: proof.to_vec(),
        })
    }

    /// Check the initiator's confirmation. A mismatch cancels the session.
    pub async fn confirm_pin(&self, confirmation: &PinConfirmation) -> Result<()> {
        confirmation.validate()?;
        let handle = self.session(&confirmation.session_id).await?;
        let mut session = handle.lock().await;
        session.ensure_live(self.now())?;
        session.expect(PairingRole::Responder, PairingState::AwaitingPin)?;

        let peer_id = session.peer_device_id()?;
        self.admit(&peer_id, ACTION_PAIRING_CONFIRM).await?;

        let matched = match session.expected_proof.as_ref() {
            Some(expected) => constant_time_compare(expected.as_slice(), &confirmation.proof),
            None => {
                return Err(CoreError::InvalidState(format!(
                    "session {} has no PIN entered yet",
                    session.id
                )))
            }
        };

        if !matched {
            session.cancel(CancelReason::PeerProofMismatch);
            warn!(session_id = %session.id, peer = %peer_id, "Initiator proof mismatch, session cancelled");
            return Err(CoreError::Authentication(
                "initiator proof mismatch, session cancelled".into(),
            ));
        }

        session.expected_proof = None;
        session.state = PairingState::Verified;
        info!(session_id = %session.id, peer = %peer_id, "PIN confirmed");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Either side
    // ------------------------------------------------------------------------

    /// Trust the peer, record the pairing and hand out the session key.
    ///
    /// Any failure cancels the session and leaves no trust behind.
    pub async fn complete(&self, session_id: &str) -> Result<SessionKey> {
        let handle = self.session(session_id).await?;
        let mut session = handle.lock().await;
        let now = self.now();
        session.ensure_live(now)?;
        if session.state != PairingState::Verified {
            return Err(CoreError::InvalidState(format!(
                "session {} is {}, complete needs verified",
                session.id, session.state
            )));
        }

        let peer_certificate = session
            .peer_certificate
            .clone()
            .ok_or_else(|| session.missing("peer certificate"))?;
        let peer_device = session
            .peer_device
            .clone()
            .ok_or_else(|| session.missing("peer device"))?;

        let key = match session.session_key() {
            Ok(key) => key,
            Err(e) => {
                session.cancel(CancelReason::CompletionFailed);
                return Err(e);
            }
        };
        let previously_trusted = self
            .certificates
            .is_trusted(&peer_certificate.fingerprint)
            .await;

        let trusted = match self
            .certificates
            .trust_certificate_at(&peer_certificate, now)
            .await
        {
            Ok(cert) => cert,
            Err(e) => {
                let reason = match e {
                    CoreError::Trust(_) => CancelReason::TrustFailure,
                    _ => CancelReason::CompletionFailed,
                };
                session.cancel(reason);
                warn!(session_id = %session.id, peer = %peer_device.id, error = %e, "Could not trust peer certificate");
                return Err(e);
            }
        };

        let record = PairedDevice {
            device: Device {
                status: DeviceStatus::Paired,
                last_seen: now,
                ..peer_device
            },
            certificate_id: trusted.id.clone(),
            fingerprint: trusted.fingerprint.clone(),
            paired_at: now,
            session_id: session.id.clone(),
        };
        let peer_id = record.device.id.clone();

        if let Err(e) = self.save_paired(record).await {
            if !previously_trusted {
                if let Err(revoke_err) = self.certificates.revoke_trust(&trusted.id).await {
                    warn!(cert_id = %trusted.id, error = %revoke_err, "Failed to roll back trust");
                }
            }
            session.cancel(CancelReason::CompletionFailed);
            warn!(session_id = %session.id, peer = %peer_id, error = %e, "Failed to persist paired device");
            return Err(e);
        }

        session.state = PairingState::Completed;
        session.wipe();
        self.limiter.reset_device(&peer_id).await;

        info!(
            session_id = %session.id,
            peer = %peer_id,
            fingerprint = %trusted.fingerprint,
            "Pairing completed"
        );
        Ok(SessionKey::new(
            session.id.clone(),
            self.identity.device_id().to_string(),
            peer_id,
            key,
        ))
    }

    /// Cancel a session. Cancelling twice is not an error.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let handle = self.session(session_id).await?;
        let mut session = handle.lock().await;
        match session.state {
            PairingState::Cancelled => Ok(()),
            PairingState::Completed => Err(CoreError::InvalidState(format!(
                "session {} is already completed",
                session.id
            ))),
            _ => {
                let reason = if session.is_expired_at(self.now()) {
                    CancelReason::Expired
                } else {
                    CancelReason::Requested
                };
                session.cancel(reason);
                info!(session_id = %session.id, "Pairing session cancelled");
                Ok(())
            }
        }
    }

    /// Current state, with expiry applied.
    pub async fn session_state(&self, session_id: &str) -> Result<PairingState> {
        Ok(self.session_info(session_id).await?.state)
    }

    pub async fn session_info(&self, session_id: &str) -> Result<SessionInfo> {
        let handle = self.session(session_id).await?;
        let mut session = handle.lock().await;
        if !session.state.is_terminal() && session.is_expired_at(self.now()) {
            session.cancel(CancelReason::Expired);
        }
        Ok(session.info())
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        let now = self.now();
        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            let mut session = handle.lock().await;
            if !session.state.is_terminal() && session.is_expired_at(now) {
                session.cancel(CancelReason::Expired);
            }
            infos.push(session.info());
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Drop every session that is past its expiry or already finished.
    /// Returns how many were removed.
    pub async fn cleanup_expired_sessions(&self) -> usize {
        let handles: Vec<(String, SessionHandle)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect();
        let now = self.now();

        let mut stale = Vec::new();
        for (id, handle) in handles {
            let mut session = handle.lock().await;
            if session.state.is_terminal() {
                stale.push(id);
            } else if session.is_expired_at(now) {
                session.cancel(CancelReason::Expired);
                stale.push(id);
            }
        }

        if !stale.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in &stale {
                sessions.remove(id);
            }
            info!(removed = stale.len(), "Removed stale pairing sessions");
        }
        stale.len()
    }

    // ------------------------------------------------------------------------
    // Paired devices
    // ------------------------------------------------------------------------

    pub async fn get_paired_devices(&self) -> Vec<PairedDevice> {
        let mut devices: Vec<_> = self.paired.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.paired_at.cmp(&b.paired_at));
        devices
    }

    pub async fn get_paired_device(&self, device_id: &str) -> Option<PairedDevice> {
        self.paired.read().await.get(device_id).cloned()
    }

    pub async fn is_paired(&self, device_id: &str) -> bool {
        self.paired.read().await.contains_key(device_id)
    }

    /// Forget a paired device and revoke trust in its certificate.
    ///
    /// Returns `false` if the device was not paired.
    pub async fn unpair(&self, device_id: &str) -> Result<bool> {
        let mut paired = self.paired.write().await;
        let Some(record) = paired.remove(device_id) else {
            debug!(device_id, "Unpair requested for unknown device");
            return Ok(false);
        };

        if let Err(e) = self.certificates.revoke_trust(&record.certificate_id).await {
            paired.insert(device_id.to_string(), record);
            return Err(e);
        }
        self.persist_paired(&paired).await?;

        info!(device_id, fingerprint = %record.fingerprint, "Device unpaired");
        Ok(true)
    }

    async fn save_paired(&self, record: PairedDevice) -> Result<()> {
        let mut paired = self.paired.write().await;
        let device_id = record.device.id.clone();
        let previous = paired.insert(device_id.clone(), record);
        if let Err(e) = self.persist_paired(&paired).await {
            match previous {
                Some(prev) => {
                    paired.insert(device_id, prev);
                }
                None => {
                    paired.remove(&device_id);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn persist_paired(&self, paired: &HashMap<String, PairedDevice>) -> Result<()> {
        let mut records: Vec<&PairedDevice> = paired.values().collect();
        records.sort_by(|a, b| a.paired_at.cmp(&b.paired_at));
        save_json(self.store.as_ref(), PAIRED_DEVICES_KEY, &records).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::TRUSTED_FINGERPRINTS_KEY;
    use crate::rate_limit::{RateLimitConfig, RateRule};
    use crate::store::{FailingStore, InMemoryStore};
    use crate::types::Platform;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct Side {
        manager: PairingManager,
        time: Arc<StdMutex<DateTime<Utc>>>,
    }

    impl Side {
        fn advance(&self, secs: i64) {
            let mut t = self.time.lock().unwrap();
            *t += chrono::Duration::seconds(secs);
        }
    }

    fn limiter(max_pin_attempts: u32) -> Arc<RateLimiter> {
        let mut config = RateLimitConfig::default();
        config.actions.insert(
            ACTION_PAIRING_PIN.to_string(),
            RateRule::new(max_pin_attempts, Duration::from_secs(300)),
        );
        Arc::new(RateLimiter::new(config))
    }

    async fn side(name: &str) -> Side {
        side_with(name, InMemoryStore::new_shared(), Utc::now()).await
    }

    async fn side_with(name: &str, store: Arc<dyn KeyValueStore>, start: DateTime<Utc>) -> Side {
        let identity = LocalIdentity::generate(name, Platform::Linux);
        let certificates = Arc::new(CertificateService::new(store.clone(), 30));
        let time = Arc::new(StdMutex::new(start));
        let clock_time = time.clone();
        let manager = PairingManager::new(
            identity,
            certificates,
            limiter(3),
            store,
            PairingConfig::default(),
        )
        .await
        .unwrap()
        .with_clock(Arc::new(move || *clock_time.lock().unwrap()));
        Side { manager, time }
    }

    /// Runs the handshake up to the point where the responder must type a PIN.
    async fn joined(a: &Side, b: &Side) -> Initiation {
        let init = a.manager.initiate().await.unwrap();
        let resp = b.manager.join(&init.payload).await.unwrap();
        a.manager.accept_join(&resp).await.unwrap();
        init
    }

    /// Runs the handshake until both sides are verified.
    async fn verified(a: &Side, b: &Side) -> Initiation {
        let init = joined(a, b).await;
        let challenge = b.manager.verify_pin(&init.session_id, &init.pin).await.unwrap();
        let confirmation = a.manager.verify_pin_challenge(&challenge).await.unwrap();
        b.manager.confirm_pin(&confirmation).await.unwrap();
        init
    }

    async fn pin_attempts_left(side: &Side, peer_id: &str) -> u32 {
        side.manager
            .limiter
            .check_action_at(peer_id, ACTION_PAIRING_PIN, Instant::now())
            .await
            .remaining
    }

    fn wrong_pin(pin: &str) -> String {
        pin.chars()
            .map(|c| if c == '9' { '0' } else { ((c as u8) + 1) as char })
            .collect()
    }

    #[tokio::test]
    async fn test_missing_pin_rule_rejected() {
        let store: Arc<dyn KeyValueStore> = InMemoryStore::new_shared();
        let identity = LocalIdentity::generate("a", Platform::Linux);
        let certificates = Arc::new(CertificateService::new(store.clone(), 30));
        let result = PairingManager::new(
            identity,
            certificates,
            Arc::new(RateLimiter::new(RateLimitConfig::default())),
            store,
            PairingConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[tokio::test]
    async fn test_initiate_states_and_redaction() {
        let a = side("a").await;
        let init = a.manager.initiate().await.unwrap();
        assert_eq!(init.pin.len(), 6);
        assert!(!init.payload.contains(&init.pin));
        assert!(!format!("{:?}", init).contains(&init.pin));
        assert_eq!(
            a.manager.session_state(&init.session_id).await.unwrap(),
            PairingState::AwaitingJoin
        );
    }

    #[tokio::test]
    async fn test_full_handshake_yields_matching_keys() {
        let a = side("a").await;
        let b = side("b").await;
        let init = joined(&a, &b).await;

        let challenge = b.manager.verify_pin(&init.session_id, &init.pin).await.unwrap();
        let confirmation = a.manager.verify_pin_challenge(&challenge).await.unwrap();
        b.manager.confirm_pin(&confirmation).await.unwrap();

        let ka = a.manager.complete(&init.session_id).await.unwrap();
        let kb = b.manager.complete(&init.session_id).await.unwrap();
        assert_eq!(ka.key().as_bytes(), kb.key().as_bytes());
        assert_eq!(ka.peer_device_id(), b.manager.identity().device_id());
        assert_eq!(kb.peer_device_id(), a.manager.identity().device_id());
        assert_eq!(
            a.manager.session_state(&init.session_id).await.unwrap(),
            PairingState::Completed
        );
        assert!(a.manager.is_paired(b.manager.identity().device_id()).await);
    }

    #[tokio::test]
    async fn test_wrong_pin_can_be_retried() {
        let a = side("a").await;
        let b = side("b").await;
        let init = joined(&a, &b).await;

        let bad = b
            .manager
            .verify_pin(&init.session_id, &wrong_pin(&init.pin))
            .await
            .unwrap();
        let err = a.manager.verify_pin_challenge(&bad).await.unwrap_err();
        assert!(matches!(err, CoreError::Authentication(_)));
        assert_eq!(
            a.manager.session_state(&init.session_id).await.unwrap(),
            PairingState::AwaitingPin
        );

        let good = b.manager.verify_pin(&init.session_id, &init.pin).await.unwrap();
        let confirmation = a.manager.verify_pin_challenge(&good).await.unwrap();
        b.manager.confirm_pin(&confirmation).await.unwrap();
        assert_eq!(
            b.manager.session_state(&init.session_id).await.unwrap(),
            PairingState::Verified
        );
    }

    #[tokio::test]
    async fn test_pin_budget_exhaustion_cancels() {
        let a = side("a").await;
        let b = side("b").await;
        let init = joined(&a, &b).await;
        let bad = b
            .manager
            .verify_pin(&init.session_id, &wrong_pin(&init.pin))
            .await
            .unwrap();

        for _ in 0..3 {
            assert!(matches!(
                a.manager.verify_pin_challenge(&bad).await,
                Err(CoreError::Authentication(_))
            ));
        }
        let info = a.manager.session_info(&init.session_id).await.unwrap();
        assert_eq!(info.state, PairingState::Cancelled);
        assert_eq!(info.cancel_reason, Some(CancelReason::PinAttemptsExhausted));

        let good = b.manager.verify_pin(&init.session_id, &init.pin).await.unwrap();
        assert!(matches!(
            a.manager.verify_pin_challenge(&good).await,
            Err(CoreError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_forged_confirmation_cancels_responder() {
        let a = side("a").await;
        let b = side("b").await;
        let init = joined(&a, &b).await;
        b.manager.verify_pin(&init.session_id, &init.pin).await.unwrap();

        let forged = PinConfirmation {
            session_id: init.session_id.clone(),
            proof: vec![0u8; 32],
        };
        assert!(matches!(
            b.manager.confirm_pin(&forged).await,
            Err(CoreError::Authentication(_))
        ));
        assert_eq!(
            b.manager.session_state(&init.session_id).await.unwrap(),
            PairingState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_out_of_order_operations() {
        let a = side("a").await;
        let b = side("b").await;
        let init = a.manager.initiate().await.unwrap();

        assert!(matches!(
            a.manager.complete(&init.session_id).await,
            Err(CoreError::InvalidState(_))
        ));
        assert!(matches!(
            a.manager.verify_pin(&init.session_id, "123456").await,
            Err(CoreError::InvalidState(_))
        ));
        assert!(matches!(
            b.manager.verify_pin(&init.session_id, "123456").await,
            Err(CoreError::SessionNotFound(_))
        ));
        assert!(matches!(
            b.manager.verify_pin(&init.session_id, "12ab").await,
            Err(CoreError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_self_pairing_rejected() {
        let a = side("a").await;
        let init = a.manager.initiate().await.unwrap();
        assert!(matches!(
            a.manager.join(&init.payload).await,
            Err(CoreError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_forged_join_response_leaves_session_alive() {
        let a = side("a").await;
        let b = side("b").await;
        let init = a.manager.initiate().await.unwrap();
        let mut resp = b.manager.join(&init.payload).await.unwrap();

        let genuine = resp.clone();
        resp.certificate.signature[0] ^= 0xff;
        assert!(matches!(
            a.manager.accept_join(&resp).await,
            Err(CoreError::Trust(_))
        ));
        assert_eq!(
            a.manager.session_state(&init.session_id).await.unwrap(),
            PairingState::AwaitingJoin
        );
        a.manager.accept_join(&genuine).await.unwrap();
    }

    #[tokio::test]
    async fn test_expiry_is_lazy_and_reported() {
        let a = side("a").await;
        let b = side("b").await;
        let init = joined(&a, &b).await;

        a.advance(301);
        let challenge = b.manager.verify_pin(&init.session_id, &init.pin).await.unwrap();
        assert!(matches!(
            a.manager.verify_pin_challenge(&challenge).await,
            Err(CoreError::SessionExpired(_))
        ));
        assert!(matches!(
            a.manager.complete(&init.session_id).await,
            Err(CoreError::SessionExpired(_))
        ));
        let info = a.manager.session_info(&init.session_id).await.unwrap();
        assert_eq!(info.cancel_reason, Some(CancelReason::Expired));

        b.advance(301);
        assert_eq!(
            b.manager.session_state(&init.session_id).await.unwrap(),
            PairingState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_join_rejects_expired_invitation() {
        let a = side("a").await;
        let b = side("b").await;
        let init = a.manager.initiate().await.unwrap();
        b.advance(600);
        assert!(matches!(
            b.manager.join(&init.payload).await,
            Err(CoreError::SessionExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_semantics() {
        let a = side("a").await;
        let init = a.manager.initiate().await.unwrap();
        a.manager.cancel(&init.session_id).await.unwrap();
        a.manager.cancel(&init.session_id).await.unwrap();
        assert_eq!(
            a.manager.session_info(&init.session_id).await.unwrap().cancel_reason,
            Some(CancelReason::Requested)
        );
        assert!(matches!(
            a.manager.cancel("nope").await,
            Err(CoreError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_and_finished() {
        let a = side("a").await;
        let b = side("b").await;
        let old = a.manager.initiate().await.unwrap();
        a.advance(200);
        let fresh = a.manager.initiate().await.unwrap();
        let cancelled = a.manager.initiate().await.unwrap();
        a.manager.cancel(&cancelled.session_id).await.unwrap();
        let done = verified(&a, &b).await;
        a.manager.complete(&done.session_id).await.unwrap();
        a.advance(150);

        assert_eq!(a.manager.cleanup_expired_sessions().await, 3);
        for gone in [&old, &cancelled, &done] {
            assert!(matches!(
                a.manager.session_state(&gone.session_id).await,
                Err(CoreError::SessionNotFound(_))
            ));
        }
        assert_eq!(
            a.manager.session_state(&fresh.session_id).await.unwrap(),
            PairingState::AwaitingJoin
        );
        assert!(a.manager.is_paired(b.manager.identity().device_id()).await);
    }

    #[tokio::test]
    async fn test_swapped_key_share_fails_pairing() {
        let a = side("a").await;
        let b = side("b").await;
        let init = a.manager.initiate().await.unwrap();

        let mut tampered = init.invitation.clone();
        tampered.ecdh_public = EcdhKeyPair::generate().public_key();
        let resp = b.manager.join_invitation(tampered).await.unwrap();
        a.manager.accept_join(&resp).await.unwrap();

        let challenge = b.manager.verify_pin(&init.session_id, &init.pin).await.unwrap();
        assert!(matches!(
            a.manager.verify_pin_challenge(&challenge).await,
            Err(CoreError::Authentication(_))
        ));
        assert_eq!(pin_attempts_left(&a, b.manager.identity().device_id()).await, 2);
        assert_eq!(
            a.manager.session_state(&init.session_id).await.unwrap(),
            PairingState::AwaitingPin
        );
        assert!(!a.manager.is_paired(b.manager.identity().device_id()).await);
    }

    #[tokio::test]
    async fn test_swapped_pake_message_fails_pairing() {
        let a = side("a").await;
        let b = side("b").await;
        let init = a.manager.initiate().await.unwrap();

        // Replaced by a party that had to guess the PIN.
        let (id_a, id_b) = PairingManager::pake_identities(&init.session_id);
        let guess = PakeInitiator::start(
            wrong_pin(&init.pin).as_bytes(),
            id_a.as_bytes(),
            id_b.as_bytes(),
        )
        .unwrap();
        let mut tampered = init.invitation.clone();
        tampered.pake_message = guess.message().to_vec();
        let resp = b.manager.join_invitation(tampered).await.unwrap();
        a.manager.accept_join(&resp).await.unwrap();

        let challenge = b.manager.verify_pin(&init.session_id, &init.pin).await.unwrap();
        assert!(matches!(
            a.manager.verify_pin_challenge(&challenge).await,
            Err(CoreError::Authentication(_))
        ));
        assert_eq!(pin_attempts_left(&a, b.manager.identity().device_id()).await, 2);
    }

    #[tokio::test]
    async fn test_garbage_pake_reply_charges_budget() {
        let a = side("a").await;
        let b = side("b").await;
        let init = joined(&a, &b).await;

        let mut challenge = b.manager.verify_pin(&init.session_id, &init.pin).await.unwrap();
        challenge.pake_message[0] = 0x41;
        assert!(matches!(
            a.manager.verify_pin_challenge(&challenge).await,
            Err(CoreError::Authentication(_))
        ));
        assert_eq!(pin_attempts_left(&a, b.manager.identity().device_id()).await, 2);
    }

    #[tokio::test]
    async fn test_peer_certificate_expiring_before_complete_cancels() {
        // Peer certificates are valid for 30 days from real time; start the
        // initiator's clock a minute before that runs out.
        let start = Utc::now() + chrono::Duration::days(30) - chrono::Duration::seconds(60);
        let a = side_with("a", InMemoryStore::new_shared(), start).await;
        let b = side("b").await;
        let init = verified(&a, &b).await;

        a.advance(120);
        assert!(matches!(
            a.manager.complete(&init.session_id).await,
            Err(CoreError::Trust(_))
        ));
        let info = a.manager.session_info(&init.session_id).await.unwrap();
        assert_eq!(info.state, PairingState::Cancelled);
        assert_eq!(info.cancel_reason, Some(CancelReason::TrustFailure));
        assert!(a.manager.certificates().list_trusted().await.is_empty());
        assert!(!a.manager.is_paired(b.manager.identity().device_id()).await);
    }

    async fn assert_complete_rolls_back(failing_key: &str) {
        let store = FailingStore::new_shared();
        let a = side_with("a", store.clone(), Utc::now()).await;
        let b = side("b").await;
        let init = verified(&a, &b).await;
        let peer_id = b.manager.identity().device_id().to_string();
        let peer_fp = b.manager.identity().fingerprint();

        store.fail_writes_to(Some(failing_key));
        assert!(matches!(
            a.manager.complete(&init.session_id).await,
            Err(CoreError::Store(_))
        ));
        let info = a.manager.session_info(&init.session_id).await.unwrap();
        assert_eq!(info.state, PairingState::Cancelled);
        assert_eq!(info.cancel_reason, Some(CancelReason::CompletionFailed));
        assert!(!a.manager.certificates().is_trusted(&peer_fp).await);
        assert!(!a.manager.is_paired(&peer_id).await);

        store.fail_writes_to(None);
        let shared: Arc<dyn KeyValueStore> = store.clone();
        let certificates = CertificateService::load(shared.clone(), 30).await.unwrap();
        assert!(!certificates.is_trusted(&peer_fp).await);
        let reloaded = PairingManager::new(
            a.manager.identity().clone(),
            Arc::new(certificates),
            limiter(3),
            shared,
            PairingConfig::default(),
        )
        .await
        .unwrap();
        assert!(!reloaded.is_paired(&peer_id).await);
    }

    #[tokio::test]
    async fn test_trust_write_failure_during_complete_rolls_back() {
        assert_complete_rolls_back(TRUSTED_FINGERPRINTS_KEY).await;
    }

    #[tokio::test]
    async fn test_paired_write_failure_during_complete_rolls_back() {
        assert_complete_rolls_back(PAIRED_DEVICES_KEY).await;
    }

    #[tokio::test]
    async fn test_unpair_unknown_device() {
        let a = side("a").await;
        assert!(!a.manager.unpair("ghost").await.unwrap());
    }
}
