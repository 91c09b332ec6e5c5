//! Property-based tests for the key material primitives.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::aead::{decrypt, encrypt};
    use crate::error::CryptoError;
    use crate::hash::fingerprint;
    use crate::mac::{generate_hmac, verify_hmac};
    use crate::transcript::Transcript;

    proptest! {
        // decrypt(encrypt(data, key)) == data
        #[test]
        fn property_aead_round_trip(
            key in any::<[u8; 32]>(),
            data in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let sealed = encrypt(&data, &key).unwrap();
            prop_assert_eq!(decrypt(&sealed, &key).unwrap(), data);
        }

        // Flipping any byte of encrypted, iv or tag is detected.
        #[test]
        fn property_aead_tamper_detected(
            key in any::<[u8; 32]>(),
            data in prop::collection::vec(any::<u8>(), 1..256),
            field in 0usize..3,
            position in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let mut sealed = encrypt(&data, &key).unwrap();
            let target = match field {
                0 => &mut sealed.encrypted,
                1 => &mut sealed.iv,
                _ => &mut sealed.tag,
            };
            let i = position.index(target.len());
            target[i] ^= flip;

            prop_assert_eq!(decrypt(&sealed, &key), Err(CryptoError::Authentication));
        }

        #[test]
        fn property_fingerprint_deterministic_and_distinct(
            a in any::<[u8; 32]>(),
            b in any::<[u8; 32]>(),
        ) {
            prop_assert_eq!(fingerprint(&a), fingerprint(&a));
            if a != b {
                prop_assert_ne!(fingerprint(&a), fingerprint(&b));
            }
        }

        #[test]
        fn property_hmac_verifies_only_original(
            key in prop::collection::vec(any::<u8>(), 1..64),
            data in prop::collection::vec(any::<u8>(), 0..128),
            extra in any::<u8>(),
        ) {
            let mac = generate_hmac(&data, &key).unwrap();
            prop_assert!(verify_hmac(&data, &key, &mac).is_ok());

            let mut other = data.clone();
            other.push(extra);
            prop_assert!(verify_hmac(&other, &key, &mac).is_err());
        }

        #[test]
        fn property_transcript_determinism(
            tag in any::<u32>(),
            data in any::<Vec<u8>>(),
            n in any::<u64>(),
        ) {
            let mut t1 = Transcript::new("pf_prop");
            t1.append_bytes(tag, &data).append_u64(tag.wrapping_add(1), n);
            let mut t2 = Transcript::new("pf_prop");
            t2.append_bytes(tag, &data).append_u64(tag.wrapping_add(1), n);
            prop_assert_eq!(t1.digest(), t2.digest());
        }
    }
}
