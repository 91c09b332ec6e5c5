//! SPAKE2 password-authenticated key exchange over Ed25519.
//!
//! Pairing feeds the PIN into this exchange. A party that does not know
//! the PIN gets one online guess per run and learns nothing it could
//! search offline from the messages it sees.

use std::fmt;

use rand_chacha::ChaCha20Rng;
use rand_core::{OsRng, SeedableRng};
use spake2::{Ed25519Group, Identity, Password, Spake2};
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};
use crate::random::random_array;

/// Side byte plus a compressed Edwards point.
pub const PAKE_MESSAGE_LEN: usize = 33;
pub const PAKE_SEED_LEN: usize = 32;

/// Key agreed by one PAKE run. Both sides hold the same bytes only when
/// they used the same password.
#[derive(Clone)]
pub struct PakeKey(Zeroizing<Vec<u8>>);

impl PakeKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PakeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PakeKey([REDACTED])")
    }
}

/// Initiator half of the exchange.
///
/// The ephemeral scalar is drawn from a stored seed, so one outgoing
/// message can be finished against several responder messages. Pairing
/// relies on this to let the responder retype a PIN without a new
/// invitation.
#[derive(Clone)]
pub struct PakeInitiator {
    seed: Zeroizing<[u8; PAKE_SEED_LEN]>,
    password: Zeroizing<Vec<u8>>,
    id_a: Vec<u8>,
    id_b: Vec<u8>,
    message: Vec<u8>,
}

impl PakeInitiator {
    pub fn start(password: &[u8], id_a: &[u8], id_b: &[u8]) -> Result<Self> {
        Ok(Self::with_seed(password, id_a, id_b, random_array::<PAKE_SEED_LEN>()?))
    }

    pub fn with_seed(password: &[u8], id_a: &[u8], id_b: &[u8], seed: [u8; PAKE_SEED_LEN]) -> Self {
        let mut initiator = Self {
            seed: Zeroizing::new(seed),
            password: Zeroizing::new(password.to_vec()),
            id_a: id_a.to_vec(),
            id_b: id_b.to_vec(),
            message: Vec::new(),
        };
        let (_, message) = initiator.state();
        initiator.message = message;
        initiator
    }

    fn state(&self) -> (Spake2<Ed25519Group>, Vec<u8>) {
        Spake2::<Ed25519Group>::start_a_with_rng(
            &Password::new(&self.password),
            &Identity::new(&self.id_a),
            &Identity::new(&self.id_b),
            ChaCha20Rng::from_seed(*self.seed),
        )
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    /// Key for one responder message. A responder that used another
    /// password produces a different key, not an error.
    pub fn finish(&self, peer_message: &[u8]) -> Result<PakeKey> {
        check_message(peer_message)?;
        let (state, _) = self.state();
        let key = state
            .finish(peer_message)
            .map_err(|e| CryptoError::InvalidInput(format!("pake message: {e:?}")))?;
        Ok(PakeKey(Zeroizing::new(key)))
    }
}

impl fmt::Debug for PakeInitiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PakeInitiator")
            .field("message", &hex::encode(&self.message))
            .finish_non_exhaustive()
    }
}

/// Responder half: answers an initiator message in one step.
pub fn pake_respond(
    password: &[u8],
    id_a: &[u8],
    id_b: &[u8],
    initiator_message: &[u8],
) -> Result<(Vec<u8>, PakeKey)> {
    check_message(initiator_message)?;
    let (state, message) = Spake2::<Ed25519Group>::start_b_with_rng(
        &Password::new(password),
        &Identity::new(id_a),
        &Identity::new(id_b),
        OsRng,
    );
    let key = state
        .finish(initiator_message)
        .map_err(|e| CryptoError::InvalidInput(format!("pake message: {e:?}")))?;
    Ok((message, PakeKey(Zeroizing::new(key))))
}

fn check_message(message: &[u8]) -> Result<()> {
    if message.len() != PAKE_MESSAGE_LEN {
        return Err(CryptoError::bad_length("pake message", PAKE_MESSAGE_LEN, message.len()));
    }
    Ok(())
}
