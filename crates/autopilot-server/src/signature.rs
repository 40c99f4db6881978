use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header Sentry puts the hex HMAC-SHA256 of the raw body in.
pub(crate) const SENTRY_SIGNATURE_HEADER: &str = "sentry-hook-signature";

#[cfg(test)]
pub(crate) fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of `signature_hex` against the HMAC of `body`.
pub(crate) fn verify(secret: &[u8], body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_signature() {
        let body = br#"{"action":"created"}"#;
        let sig = sign(b"s3cret", body);
        assert_eq!(sig.len(), 64);
        assert!(verify(b"s3cret", body, &sig));
    }

    #[test]
    fn rejects_tampering_and_garbage() {
        let body = br#"{"action":"created"}"#;
        let sig = sign(b"s3cret", body);
        assert!(!verify(b"other", body, &sig));
        assert!(!verify(b"s3cret", br#"{"action":"resolved"}"#, &sig));
        assert!(!verify(b"s3cret", body, ""));
        assert!(!verify(b"s3cret", body, "not-hex"));
        assert!(!verify(b"s3cret", body, &sig[..32]));
    }
}
