//! RSA key pairs for key wrapping (OAEP) and signatures (PSS), both over
//! SHA-256. Public keys travel as SPKI DER, private keys as PKCS#8 DER.

use std::fmt;

use rand_core::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{Oaep, Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};

pub const MIN_RSA_BITS: usize = 2048;
pub const DEFAULT_RSA_BITS: usize = 2048;

pub struct RsaKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl RsaKeyPair {
    pub fn generate(bits: usize) -> Result<Self> {
        if bits < MIN_RSA_BITS {
            return Err(CryptoError::InvalidInput(format!(
                "rsa modulus must be at least {MIN_RSA_BITS} bits, got {bits}"
            )));
        }
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyDerivation(format!("rsa key generation: {e}")))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| CryptoError::InvalidInput(format!("rsa private key: {e}")))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    pub fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>> {
        let doc = self
            .private
            .to_pkcs8_der()
            .map_err(|e| CryptoError::Encoding(format!("rsa private key: {e}")))?;
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        let doc = self
            .public
            .to_public_key_der()
            .map_err(|e| CryptoError::Encoding(format!("rsa public key: {e}")))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// Unwrap data sealed with [`rsa_encrypt`]. Any padding failure reads
    /// as `Authentication`.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::Authentication)
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha256::digest(message);
        self.private
            .sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), &digest)
            .map_err(|e| CryptoError::InvalidInput(format!("rsa sign: {e}")))
    }
}

impl fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKeyPair")
            .field("bits", &rsa::traits::PublicKeyParts::size(&self.public).saturating_mul(8))
            .finish_non_exhaustive()
    }
}

fn parse_public_key(der: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(der)
        .map_err(|e| CryptoError::InvalidInput(format!("rsa public key: {e}")))
}

/// OAEP-wrap `data` to the holder of `public_key_der`.
pub fn rsa_encrypt(public_key_der: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let public = parse_public_key(public_key_der)?;
    public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), data)
        .map_err(|e| CryptoError::InvalidInput(format!("rsa encrypt: {e}")))
}

pub fn rsa_verify(public_key_der: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let public = parse_public_key(public_key_der)?;
    let digest = Sha256::digest(message);
    public
        .verify(Pss::new::<Sha256>(), &digest, signature)
        .map_err(|_| CryptoError::Authentication)
}
