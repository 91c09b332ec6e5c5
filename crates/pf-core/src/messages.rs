//! Pairing wire messages.
//!
//! A closed set of tagged variants. Everything received from a peer goes
//! through [`PairingMessage::decode`], which validates before returning.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use pf_crypto::encoding::{base64_bytes, base64_key32};
use pf_crypto::kdf::SALT_LEN;
use pf_crypto::mac::MAC_LEN;
use pf_crypto::PAKE_MESSAGE_LEN;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::certificate::Certificate;
use crate::errors::{CoreError, Result};
use crate::types::Device;

pub const PROTOCOL_VERSION: u32 = 2;

/// QR payload shown by the initiator. Never carries the PIN.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub version: u32,
    pub session_id: String,
    pub device: Device,
    pub certificate: Certificate,
    #[serde(with = "base64_key32")]
    pub ecdh_public: [u8; 32],
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    /// Initiator's SPAKE2 message, keyed by the PIN.
    #[serde(with = "base64_bytes")]
    pub pake_message: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub session_id: String,
    pub device: Device,
    pub certificate: Certificate,
    #[serde(with = "base64_key32")]
    pub ecdh_public: [u8; 32],
}

/// Responder's SPAKE2 reply for the PIN it was given, plus a proof keyed
/// by the resulting secret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinChallenge {
    pub session_id: String,
    #[serde(with = "base64_bytes")]
    pub pake_message: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub proof: Vec<u8>,
}

/// Initiator's acknowledgment once the challenge matched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinConfirmation {
    pub session_id: String,
    #[serde(with = "base64_bytes")]
    pub proof: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PairingMessage {
    Invitation(Invitation),
    JoinResponse(JoinResponse),
    PinChallenge(PinChallenge),
    PinConfirmation(PinConfirmation),
}

fn check_session_id(session_id: &str) -> Result<()> {
    Uuid::parse_str(session_id)
        .map(|_| ())
        .map_err(|_| CoreError::InvalidPayload(format!("malformed session id {session_id:?}")))
}

fn check_identity(device: &Device, cert: &Certificate) -> Result<()> {
    if device.id != cert.device_id || device.public_key != cert.public_key {
        return Err(CoreError::InvalidPayload(
            "device record does not match its certificate".into(),
        ));
    }
    if cert.device_id.is_empty() || cert.id.is_empty() {
        return Err(CoreError::InvalidPayload("certificate is missing identifiers".into()));
    }
    if cert.public_key.len() != 32 {
        return Err(CoreError::InvalidPayload(format!(
            "certificate public key must be 32 bytes, got {}",
            cert.public_key.len()
        )));
    }
    Ok(())
}

fn check_pake_message(message: &[u8]) -> Result<()> {
    if message.len() != PAKE_MESSAGE_LEN {
        return Err(CoreError::InvalidPayload(format!(
            "pake message must be {PAKE_MESSAGE_LEN} bytes, got {}",
            message.len()
        )));
    }
    Ok(())
}

fn check_proof(proof: &[u8]) -> Result<()> {
    if proof.len() != MAC_LEN {
        return Err(CoreError::InvalidPayload(format!(
            "proof must be {MAC_LEN} bytes, got {}",
            proof.len()
        )));
    }
    Ok(())
}

impl Invitation {
    pub fn validate(&self) -> Result<()> {
        check_session_id(&self.session_id)?;
        if self.version != PROTOCOL_VERSION {
            return Err(CoreError::InvalidPayload(format!(
                "unsupported protocol version {}",
                self.version
            )));
        }
        if self.salt.len() != SALT_LEN {
            return Err(CoreError::InvalidPayload(format!(
                "salt must be {SALT_LEN} bytes, got {}",
                self.salt.len()
            )));
        }
        check_pake_message(&self.pake_message)?;
        check_identity(&self.device, &self.certificate)
    }
}

impl JoinResponse {
    pub fn validate(&self) -> Result<()> {
        check_session_id(&self.session_id)?;
        check_identity(&self.device, &self.certificate)
    }
}

impl PinChallenge {
    pub fn validate(&self) -> Result<()> {
        check_session_id(&self.session_id)?;
        check_pake_message(&self.pake_message)?;
        check_proof(&self.proof)
    }
}

impl PinConfirmation {
    pub fn validate(&self) -> Result<()> {
        check_session_id(&self.session_id)?;
        check_proof(&self.proof)
    }
}

impl PairingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PairingMessage::Invitation(_) => "invitation",
            PairingMessage::JoinResponse(_) => "join_response",
            PairingMessage::PinChallenge(_) => "pin_challenge",
            PairingMessage::PinConfirmation(_) => "pin_confirmation",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            PairingMessage::Invitation(m) => &m.session_id,
            PairingMessage::JoinResponse(m) => &m.session_id,
            PairingMessage::PinChallenge(m) => &m.session_id,
            PairingMessage::PinConfirmation(m) => &m.session_id,
        }
    }

    /// Schema checks beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        match self {
            PairingMessage::Invitation(m) => m.validate(),
            PairingMessage::JoinResponse(m) => m.validate(),
            PairingMessage::PinChallenge(m) => m.validate(),
            PairingMessage::PinConfirmation(m) => m.validate(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let msg: PairingMessage = serde_json::from_str(text)?;
        msg.validate()?;
        Ok(msg)
    }

    /// Compact text form suitable for a QR code.
    pub fn encode(&self) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(payload: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim())
            .map_err(|e| CoreError::InvalidPayload(format!("payload encoding: {e}")))?;
        let msg: PairingMessage = serde_json::from_slice(&bytes)?;
        msg.validate()?;
        Ok(msg)
    }
}
