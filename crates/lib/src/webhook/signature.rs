//! Subscription handshake and payload signature checks for Meta webhooks.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header Meta signs every delivery with (`sha256=<hex>`).
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// GET handshake: returns the challenge to echo when mode is `subscribe` and the token matches.
pub fn verify_subscription(
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&str>,
    expected_token: &str,
) -> Option<String> {
    if mode != Some("subscribe") || expected_token.is_empty() {
        return None;
    }
    if token != Some(expected_token) {
        return None;
    }
    challenge.map(str::to_string)
}

/// HMAC-SHA256 over the raw body; accepts `sha256=<hex>` or bare hex.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let hex_sig = signature.trim().strip_prefix("sha256=").unwrap_or(signature.trim());
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Signature header value for a body (used by tests and local tooling).
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_echoes_challenge_on_match() {
        assert_eq!(
            verify_subscription(Some("subscribe"), Some("v"), Some("c123"), "v"),
            Some("c123".to_string())
        );
    }

    #[test]
    fn subscription_rejects_wrong_token_or_mode() {
        assert_eq!(verify_subscription(Some("subscribe"), Some("x"), Some("c"), "v"), None);
        assert_eq!(verify_subscription(Some("unsubscribe"), Some("v"), Some("c"), "v"), None);
        assert_eq!(verify_subscription(None, Some("v"), Some("c"), "v"), None);
        assert_eq!(verify_subscription(Some("subscribe"), Some(""), Some("c"), ""), None);
    }

    #[test]
    fn signature_round_trip_and_tamper() {
        let body = br#"{"object":"page","entry":[]}"#;
        let sig = sign("secret", body);
        assert!(verify_signature("secret", body, &sig));
        assert!(verify_signature("secret", body, sig.trim_start_matches("sha256=")));
        assert!(!verify_signature("other", body, &sig));
        assert!(!verify_signature("secret", b"{}", &sig));
        assert!(!verify_signature("secret", body, "sha256=not-hex"));
    }
}
