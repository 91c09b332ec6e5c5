//! Property-based tests for the rate limiter and wire parsing.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    use proptest::prelude::*;

    use crate::certificate::{export_to_pem, generate_certificate, import_from_pem};
    use crate::messages::PairingMessage;
    use crate::rate_limit::{RateLimitConfig, RateLimiter, RateRule};
    use crate::types::{LocalIdentity, Platform};

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut)
    }

    fn device_only(max: u32, window: Duration) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            global: None,
            device: Some(RateRule::new(max, window)),
            actions: HashMap::new(),
        })
    }

    proptest! {
        // Never more than max admissions inside any window.
        #[test]
        fn property_window_never_exceeded(
            max in 1u32..8,
            window_ms in 10u64..500,
            mut offsets in prop::collection::vec(0u64..2000, 1..60),
        ) {
            offsets.sort_unstable();
            let window = Duration::from_millis(window_ms);
            let limiter = device_only(max, window);
            let start = Instant::now();

            let admitted: Vec<u64> = block_on(async {
                let mut admitted = Vec::new();
                for &off in &offsets {
                    let now = start + Duration::from_millis(off);
                    if limiter.admit_at("peer", None, now).await.allowed {
                        admitted.push(off);
                    }
                }
                admitted
            });

            for &t in &admitted {
                let in_window = admitted
                    .iter()
                    .filter(|&&u| u <= t && t - u < window_ms)
                    .count();
                prop_assert!(in_window as u32 <= max, "{} admitted within {}ms", in_window, window_ms);
            }
        }

        // A burst at one instant admits exactly min(burst, max).
        #[test]
        fn property_burst_admits_exactly_max(max in 1u32..20, burst in 1u32..40) {
            let limiter = device_only(max, Duration::from_secs(60));
            let now = Instant::now();
            let allowed = block_on(async {
                let mut allowed = 0u32;
                for _ in 0..burst {
                    if limiter.admit_at("peer", None, now).await.allowed {
                        allowed += 1;
                    }
                }
                allowed
            });
            prop_assert_eq!(allowed, burst.min(max));
        }

        // Arbitrary input never panics the decoder.
        #[test]
        fn property_decode_total(input in ".{0,256}") {
            let _ = PairingMessage::decode(&input);
            let _ = PairingMessage::from_json(&input);
        }

        // Corrupting the PEM body never yields a certificate marked verified.
        #[test]
        fn property_pem_import_never_trusts(position in any::<prop::sample::Index>(), flip in 1u8..=127) {
            let identity = LocalIdentity::generate("prop", Platform::Linux);
            let cert = generate_certificate(&identity, 30).unwrap();
            let pem = export_to_pem(&cert).unwrap();

            let mut bytes = pem.into_bytes();
            let i = position.index(bytes.len());
            bytes[i] = (bytes[i] ^ flip) & 0x7f;
            if let Ok(text) = String::from_utf8(bytes) {
                if let Ok(imported) = import_from_pem(&text) {
                    prop_assert!(!imported.verified);
                }
            }
        }
    }
}
