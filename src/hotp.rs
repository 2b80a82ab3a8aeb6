//! HOTP engine (RFC 4226)
//!
//! Pure functions computing and verifying HMAC-SHA1 one-time passwords
//! over a counter look-ahead window. No side effects; safe to call
//! concurrently. Counter persistence and policy enforcement live in the
//! validation layer, not here.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;

/// Compute the HOTP code for `counter` as a zero-padded decimal string of
/// `otp_length` digits.
#[must_use]
pub fn generate(secret: &[u8], counter: u64, otp_length: u32) -> String {
    let mut mac =
        HmacSha1::new_from_slice(secret).expect("HMAC-SHA1 accepts keys of any length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation per RFC 4226 §5.3
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);

    let code = u64::from(binary) % 10u64.pow(otp_length.min(10));
    format!("{code:0width$}", width = otp_length as usize)
}

/// Verify `submitted` against the codes for `counter, counter+1, ...,
/// counter+drift` (inclusive). Returns the matched counter plus one, the
/// value the stored counter must advance to, or `None` when no counter in
/// the window produces the submitted code.
///
/// Comparison is byte-exact against the submitted ASCII digits and
/// constant-time per candidate. The whole window is always scanned so the
/// timing does not reveal which counter matched.
#[must_use]
pub fn verify(
    secret: &[u8],
    submitted: &[u8],
    counter: u64,
    otp_length: u32,
    drift: u32,
) -> Option<u64> {
    let mut matched: Option<u64> = None;
    for offset in 0..=u64::from(drift) {
        let candidate = counter.saturating_add(offset);
        let expected = generate(secret, candidate, otp_length);
        if code_eq(expected.as_bytes(), submitted) && matched.is_none() {
            matched = Some(candidate.saturating_add(1));
        }
    }
    matched
}

/// Constant-time equality for OTP codes. Length is public (it comes from
/// the policy), so a length mismatch may return early.
fn code_eq(expected: &[u8], submitted: &[u8]) -> bool {
    expected.len() == submitted.len() && bool::from(expected.ct_eq(submitted))
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4226 Appendix D test vectors, secret "12345678901234567890"
    const RFC_SECRET: &[u8] = b"12345678901234567890";
    const RFC_CODES: [&str; 10] = [
        "755224", "287082", "359152", "969429", "338314", "254676", "287922", "162583", "399871",
        "520489",
    ];

    #[test]
    fn test_rfc4226_vectors() {
        for (counter, expected) in RFC_CODES.iter().enumerate() {
            assert_eq!(generate(RFC_SECRET, counter as u64, 6), *expected);
        }
    }

    #[test]
    fn test_verify_exact_counter() {
        assert_eq!(verify(RFC_SECRET, b"755224", 0, 6, 0), Some(1));
        assert_eq!(verify(RFC_SECRET, b"287082", 1, 6, 0), Some(2));
    }

    #[test]
    fn test_verify_within_window() {
        // Code generated at counter+k verifies for all 0 <= k <= drift
        let secret = b"another shared secret";
        let counter = 42;
        let drift = 5;
        for k in 0..=drift {
            let code = generate(secret, counter + u64::from(k), 6);
            assert_eq!(
                verify(secret, code.as_bytes(), counter, 6, drift),
                Some(counter + u64::from(k) + 1),
                "k={k}"
            );
        }
    }

    #[test]
    fn test_verify_beyond_window() {
        let secret = b"another shared secret";
        let counter = 42;
        let drift = 5;
        let code = generate(secret, counter + u64::from(drift) + 1, 6);
        assert_eq!(verify(secret, code.as_bytes(), counter, 6, drift), None);
    }

    #[test]
    fn test_verify_wrong_code() {
        assert_eq!(verify(RFC_SECRET, b"000000", 0, 6, 5), None);
    }

    #[test]
    fn test_verify_length_mismatch() {
        // An 8-digit submission never matches 6-digit codes, even when the
        // digits share a prefix
        assert_eq!(verify(RFC_SECRET, b"75522400", 0, 6, 0), None);
        assert_eq!(verify(RFC_SECRET, b"", 0, 6, 5), None);
    }

    #[test]
    fn test_zero_padding() {
        // Scan for a counter whose 6-digit code has a leading zero and make
        // sure the padded form round-trips through verify
        let secret = b"padding scan secret";
        let (counter, code) = (0u64..500)
            .map(|c| (c, generate(secret, c, 6)))
            .find(|(_, code)| code.starts_with('0'))
            .expect("a leading-zero code exists in 500 counters");
        assert_eq!(code.len(), 6);
        assert_eq!(verify(secret, code.as_bytes(), counter, 6, 0), Some(counter + 1));
    }

    #[test]
    fn test_eight_digit_codes() {
        let code = generate(RFC_SECRET, 0, 8);
        assert_eq!(code.len(), 8);
        // RFC vector 755224 is the low 6 digits of the 8-digit value
        assert!(code.ends_with("755224"));
        assert_eq!(verify(RFC_SECRET, code.as_bytes(), 0, 8, 0), Some(1));
    }

    #[test]
    fn test_counter_saturation() {
        // A window straddling u64::MAX must not wrap
        let secret = b"saturation";
        let code = generate(secret, u64::MAX, 6);
        assert_eq!(
            verify(secret, code.as_bytes(), u64::MAX - 1, 6, 5),
            Some(u64::MAX)
        );
    }
}
