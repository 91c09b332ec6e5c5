//! Secure randomness: keys, tokens and PINs.
//!
//! Every value here comes from the operating system CSPRNG. A failing RNG
//! surfaces as [`CryptoError::Rng`]; there is no fallback source.

use getrandom::getrandom;

use crate::aead::{SymmetricKey, KEY_LEN};
use crate::error::{CryptoError, Result};

/// Shortest and longest PIN lengths accepted by [`generate_pin`].
pub const MIN_PIN_DIGITS: u32 = 4;
pub const MAX_PIN_DIGITS: u32 = 9;

pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    getrandom(buf).map_err(|_| CryptoError::Rng)
}

pub fn random_array<const N: usize>() -> Result<[u8; N]> {
    let mut out = [0u8; N];
    fill_random(&mut out)?;
    Ok(out)
}

/// Fresh 256-bit symmetric key.
pub fn generate_key() -> Result<SymmetricKey> {
    let bytes = random_array::<KEY_LEN>()?;
    Ok(SymmetricKey::from_bytes(bytes))
}

/// Random token of `len` bytes, hex encoded (`2 * len` characters).
pub fn generate_token(len: usize) -> Result<String> {
    if len == 0 {
        return Err(CryptoError::InvalidInput("token length must be > 0".into()));
    }
    let mut buf = vec![0u8; len];
    fill_random(&mut buf)?;
    Ok(hex::encode(buf))
}

/// Uniform numeric PIN with exactly `digits` digits (leading zeros kept).
pub fn generate_pin(digits: u32) -> Result<String> {
    if !(MIN_PIN_DIGITS..=MAX_PIN_DIGITS).contains(&digits) {
        return Err(CryptoError::InvalidInput(format!(
            "pin digits must be within {MIN_PIN_DIGITS}..={MAX_PIN_DIGITS}, got {digits}"
        )));
    }
    let bound = 10u32.pow(digits);
    // Rejection sampling keeps the distribution uniform.
    let zone = u32::MAX - (u32::MAX % bound);
    loop {
        let n = u32::from_be_bytes(random_array::<4>()?);
        if n < zone {
            return Ok(format!("{:0width$}", n % bound, width = digits as usize));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_key_is_random() {
        let a = generate_key().unwrap();
        let b = generate_key().unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_generate_token_length() {
        let token = generate_token(16).unwrap();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(generate_token(0).is_err());
    }

    #[test]
    fn test_generate_pin_shape() {
        for digits in [4, 6, 9] {
            let pin = generate_pin(digits).unwrap();
            assert_eq!(pin.len(), digits as usize);
            assert!(pin.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_generate_pin_rejects_bad_length() {
        assert!(matches!(generate_pin(3), Err(CryptoError::InvalidInput(_))));
        assert!(matches!(generate_pin(10), Err(CryptoError::InvalidInput(_))));
    }
}
