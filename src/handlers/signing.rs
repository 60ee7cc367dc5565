//! HMAC signing and verification for outbound webhook bodies.
//!
//! Wire format: `X-Signature: hex(HMAC(algorithm, secret, canonical_body))` over
//! the exact JSON bytes of the request body, with `X-Algorithm` naming the
//! primitive. This is deliberately not the `msg_id.timestamp.payload` scheme
//! some webhook senders use: the signature here covers the body alone, and
//! freshness is instead carried by the separate `X-Timestamp` header plus a
//! receiver-side clock-skew check.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const DEFAULT_ALGORITHM: &str = "HMAC-SHA256";
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

/// Sign `canonical_body` with `secret` under the named algorithm. Only
/// `HMAC-SHA256` is currently implemented; the `algorithm` parameter is kept
/// on the signature so a second primitive can be added later without
/// reshaping every call site.
pub fn sign(_algorithm: &str, secret: &str, canonical_body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any length");
    mac.update(canonical_body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time signature check. Returns `false` on malformed hex rather than
/// erroring, since an attacker-controlled header should never produce a panic
/// or an error path distinguishable from a legitimate mismatch.
pub fn verify(_algorithm: &str, secret: &str, canonical_body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(canonical_body);
    mac.verify_slice(&signature).is_ok()
}

/// Full receiver-side check: signature validity plus a bound on how stale
/// `timestamp` may be, to reject replayed requests.
pub fn verify_with_clock_skew(algorithm: &str, secret: &str, canonical_body: &[u8], signature_hex: &str, timestamp: DateTime<Utc>, max_skew_secs: i64) -> bool {
    let skew = (Utc::now() - timestamp).num_seconds().abs();
    if skew > max_skew_secs {
        return false;
    }
    verify(algorithm, secret, canonical_body, signature_hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let signature = sign(DEFAULT_ALGORITHM, "whsec_test", b"{\"a\":1}");
        assert!(verify(DEFAULT_ALGORITHM, "whsec_test", b"{\"a\":1}", &signature));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let signature = sign(DEFAULT_ALGORITHM, "whsec_test", b"{\"a\":1}");
        assert!(!verify(DEFAULT_ALGORITHM, "whsec_test", b"{\"a\":2}", &signature));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let signature = sign(DEFAULT_ALGORITHM, "whsec_test", b"{\"a\":1}");
        assert!(!verify(DEFAULT_ALGORITHM, "other_secret", b"{\"a\":1}", &signature));
    }

    #[test]
    fn malformed_hex_fails_without_panicking() {
        assert!(!verify(DEFAULT_ALGORITHM, "whsec_test", b"{\"a\":1}", "not-hex!!"));
    }

    #[test]
    fn stale_timestamp_fails_clock_skew_check() {
        let signature = sign(DEFAULT_ALGORITHM, "whsec_test", b"{\"a\":1}");
        let old = Utc::now() - chrono::Duration::seconds(DEFAULT_CLOCK_SKEW_SECS + 60);
        assert!(!verify_with_clock_skew(DEFAULT_ALGORITHM, "whsec_test", b"{\"a\":1}", &signature, old, DEFAULT_CLOCK_SKEW_SECS));
    }

    #[test]
    fn fresh_timestamp_passes_clock_skew_check() {
        let signature = sign(DEFAULT_ALGORITHM, "whsec_test", b"{\"a\":1}");
        assert!(verify_with_clock_skew(DEFAULT_ALGORITHM, "whsec_test", b"{\"a\":1}", &signature, Utc::now(), DEFAULT_CLOCK_SKEW_SECS));
    }
}
