//! HMAC-SHA256 request signatures for outbound webhook calls.
//!
//! The signature covers `"{timestamp}{payload}"` so receivers can reject
//! replayed requests by checking timestamp freshness before verifying.

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

pub fn compute_signature(secret: &[u8], payload: &[u8], timestamp: i64) -> String {
    // HMAC accepts keys of any length.
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time equality for shared secrets. Both sides are mapped through
/// HMAC so the comparison leaks neither length nor prefix.
pub fn secret_eq(a: &[u8], b: &[u8]) -> bool {
    let key = [0u8; 32];

    let mut mac = Hmac::<Sha256>::new_from_slice(&key).expect("hmac key");
    mac.update(a);
    let tag = mac.finalize().into_bytes();

    let mut mac = Hmac::<Sha256>::new_from_slice(&key).expect("hmac key");
    mac.update(b);
    mac.verify_slice(&tag).is_ok()
}

pub fn verify_signature(secret: &[u8], payload: &[u8], timestamp: i64, signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_equality() {
        assert!(secret_eq(b"s3cret", b"s3cret"));
        assert!(!secret_eq(b"s3cret", b"s3cres"));
        assert!(!secret_eq(b"s3cret", b"s3cret-longer"));
        assert!(!secret_eq(b"s3cret", b""));
        assert!(secret_eq(b"", b""));
    }

    #[test]
    fn round_trip() {
        let sig = compute_signature(b"s3cret", b"{\"a\":1}", 1700000000);
        assert!(verify_signature(b"s3cret", b"{\"a\":1}", 1700000000, &sig));
    }

    #[test]
    fn rejects_tampering() {
        let sig = compute_signature(b"s3cret", b"{\"a\":1}", 1700000000);
        assert!(!verify_signature(b"s3cret", b"{\"a\":2}", 1700000000, &sig));
        assert!(!verify_signature(b"other", b"{\"a\":1}", 1700000000, &sig));
        assert!(!verify_signature(b"s3cret", b"{\"a\":1}", 1700000001, &sig));
        assert!(!verify_signature(b"s3cret", b"{\"a\":1}", 1700000000, "zz"));
    }
}
