//! HMAC-SHA256 signing of webhook bodies.
//!
//! The `X-Webhook-Signature` header carries `sha256=<hex digest>` of the
//! exact request body keyed with the registration's secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const WEBHOOK_ID_HEADER: &str = "X-Webhook-ID";
pub const DELIVERY_ID_HEADER: &str = "X-Delivery-ID";

const PREFIX: &str = "sha256=";

fn mac(secret: &str) -> HmacSha256 {
    // HMAC accepts keys of any length, including empty ones.
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts any key length"),
    }
}

/// Header value for `body` signed with `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = mac(secret);
    mac.update(body);
    format!("{PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Check a header value in constant time.
pub fn verify(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(digest) = header.strip_prefix(PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(digest) else {
        return false;
    };
    let mut mac = mac(secret);
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// A fresh random secret for registrations that do not supply one.
pub fn generate_secret() -> String {
    format!(
        "whsec_{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic() {
        let body = br#"{"type":"tunnel.created"}"#;
        assert_eq!(sign("secret", body), sign("secret", body));
        assert!(sign("secret", body).starts_with("sha256="));
        assert_eq!(sign("secret", body).len(), PREFIX.len() + 64);
    }

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2.
        assert_eq!(
            sign("Jefe", b"what do ya want for nothing?"),
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn tampering_invalidates() {
        let body = br#"{"amount":1}"#;
        let header = sign("secret", body);
        assert!(verify("secret", body, &header));
        assert!(!verify("secret", br#"{"amount":2}"#, &header));
        assert!(!verify("other", body, &header));
        assert!(!verify("secret", body, "sha256=zz"));
        assert!(!verify("secret", body, header.trim_start_matches(PREFIX)));
    }

    #[test]
    fn generated_secrets_are_unique() {
        let a = generate_secret();
        assert_ne!(a, generate_secret());
        assert_eq!(a.len(), "whsec_".len() + 64);
    }
}
