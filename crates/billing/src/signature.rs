//! Webhook signature verification
//!
//! Stripe signs each delivery with a `Stripe-Signature` header of the form
//! `t=<unix seconds>,v1=<hex hmac>[,v1=...]`. The HMAC-SHA256 is computed
//! over `"{t}.{raw body}"` keyed with the endpoint's signing secret.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

type HmacSha256 = Hmac<Sha256>;

/// Authenticity check for inbound provider events
pub trait SignatureVerifier: Send + Sync {
    /// Returns `true` only if `signature_header` proves `payload` came from the provider
    fn verify(&self, payload: &str, signature_header: &str) -> bool;
}

/// Stripe's `v1` signing scheme
#[derive(Clone)]
pub struct StripeSignatureVerifier {
    secret: String,
    tolerance: Duration,
}

impl StripeSignatureVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    /// Build a valid header for `payload` at `timestamp`
    pub fn sign(&self, payload: &str, timestamp: i64) -> String {
        format!("t={},v1={}", timestamp, self.compute(payload, timestamp))
    }

    fn compute(&self, payload: &str, timestamp: i64) -> String {
        // HMAC accepts keys of any length
        let mut mac = match HmacSha256::new_from_slice(self.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub(crate) fn verify_at(&self, payload: &str, signature_header: &str, now: i64) -> bool {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();

        for part in signature_header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let Some(timestamp) = timestamp else {
            tracing::warn!("Missing timestamp in signature header");
            return false;
        };
        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return false;
        }

        let age = now.abs_diff(timestamp);
        if age > self.tolerance.as_secs() {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                diff = age,
                "Webhook timestamp outside tolerance"
            );
            return false;
        }

        let expected = self.compute(payload, timestamp);
        if expected.is_empty() {
            return false;
        }

        candidates
            .iter()
            .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())))
    }
}

impl SignatureVerifier for StripeSignatureVerifier {
    fn verify(&self, payload: &str, signature_header: &str) -> bool {
        self.verify_at(
            payload,
            signature_header,
            OffsetDateTime::now_utc().unix_timestamp(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const BODY: &str = r#"{"id":"evt_1","type":"invoice.paid"}"#;

    fn verifier() -> StripeSignatureVerifier {
        StripeSignatureVerifier::new(SECRET, Duration::from_secs(300))
    }

    #[test]
    fn test_valid_signature_accepted() {
        let v = verifier();
        let header = v.sign(BODY, 1_700_000_000);
        assert!(v.verify_at(BODY, &header, 1_700_000_010));
    }

    #[test]
    fn test_signature_is_hex_sha256() {
        let v = verifier();
        let header = v.sign(BODY, 1_700_000_000);
        let (_, sig) = header.split_once(",v1=").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let v = verifier();
        let header = v.sign(BODY, 1_700_000_000);
        let tampered = BODY.replace("invoice.paid", "invoice.payment_failed");
        assert!(!v.verify_at(&tampered, &header, 1_700_000_000));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = StripeSignatureVerifier::new("whsec_other", Duration::from_secs(300))
            .sign(BODY, 1_700_000_000);
        assert!(!verifier().verify_at(BODY, &header, 1_700_000_000));
    }

    #[test]
    fn test_expired_timestamp_rejected() {
        let v = verifier();
        let header = v.sign(BODY, 1_700_000_000);
        assert!(!v.verify_at(BODY, &header, 1_700_000_301));
        assert!(v.verify_at(BODY, &header, 1_700_000_300));
    }

    #[test]
    fn test_any_matching_v1_accepted() {
        let v = verifier();
        let good = v.sign(BODY, 1_700_000_000);
        let (_, sig) = good.split_once(",v1=").unwrap();
        let header = format!("t=1700000000,v1=deadbeef,v1={}", sig);
        assert!(v.verify_at(BODY, &header, 1_700_000_000));
    }

    #[test]
    fn test_malformed_headers_rejected() {
        let v = verifier();
        assert!(!v.verify_at(BODY, "", 1_700_000_000));
        assert!(!v.verify_at(BODY, "v1=abc", 1_700_000_000));
        assert!(!v.verify_at(BODY, "t=1700000000", 1_700_000_000));
        assert!(!v.verify_at(BODY, "t=soon,v1=abc", 1_700_000_000));
    }
}
