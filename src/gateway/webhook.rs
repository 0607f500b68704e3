//! Webhook signature verification and event decoding
//!
//! The processor signs each webhook delivery with an HMAC-SHA256 over
//! `"{timestamp}.{payload}"`, carried in a header of the form
//! `t=<unix-ts>,v1=<hex-mac>`. Verification checks the MAC in constant
//! time and bounds the timestamp skew to defeat replay.

use super::{GatewayError, GatewayEvent};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

/// Maximum tolerated age of a signed webhook, in seconds.
const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Verifies webhook signatures and decodes event payloads
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    /// Create a verifier with the shared webhook signing secret
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    /// Override the replay tolerance (tests)
    pub fn with_tolerance(mut self, secs: i64) -> Self {
        self.tolerance_secs = secs;
        self
    }

    /// Verify the signature header against the raw payload and decode the event
    pub fn verify(&self, payload: &[u8], signature_header: &str) -> Result<GatewayEvent, GatewayError> {
        self.check_signature(payload, signature_header, chrono::Utc::now().timestamp())?;
        parse_event(payload)
    }

    fn check_signature(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: i64,
    ) -> Result<(), GatewayError> {
        let (timestamp, expected_mac) = parse_signature_header(signature_header)?;

        if (now - timestamp).abs() > self.tolerance_secs {
            return Err(GatewayError::Signature(format!(
                "timestamp {} outside tolerance",
                timestamp
            )));
        }

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| GatewayError::Signature(e.to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);

        let expected = hex::decode(expected_mac)
            .map_err(|_| GatewayError::Signature("malformed v1 signature".into()))?;
        mac.verify_slice(&expected)
            .map_err(|_| GatewayError::Signature("signature mismatch".into()))
    }

    /// Compute a valid signature header for a payload (test support)
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }
}

fn parse_signature_header(header: &str) -> Result<(i64, &str), GatewayError> {
    let mut timestamp = None;
    let mut v1 = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(value.parse::<i64>().map_err(|_| {
                    GatewayError::Signature("malformed timestamp".into())
                })?);
            }
            Some(("v1", value)) => v1 = Some(value),
            _ => {}
        }
    }
    match (timestamp, v1) {
        (Some(t), Some(sig)) => Ok((t, sig)),
        _ => Err(GatewayError::Signature(
            "header missing t= or v1= component".into(),
        )),
    }
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

/// Decode a verified payload into a typed [`GatewayEvent`]
fn parse_event(payload: &[u8]) -> Result<GatewayEvent, GatewayError> {
    let raw: RawEvent = serde_json::from_slice(payload)
        .map_err(|e| GatewayError::Decode(format!("invalid event payload: {}", e)))?;
    let object = &raw.data.object;

    let event = match raw.event_type.as_str() {
        "payment_intent.succeeded" => GatewayEvent::PaymentIntentSucceeded {
            intent_ref: string_field(object, "id")?,
            metadata: metadata_field(object),
        },
        "payment_intent.payment_failed" => GatewayEvent::PaymentIntentFailed {
            intent_ref: string_field(object, "id")?,
            failure_message: object
                .pointer("/last_payment_error/message")
                .and_then(|v| v.as_str())
                .map(String::from),
        },
        "account.updated" => GatewayEvent::AccountUpdated {
            account_ref: string_field(object, "id")?,
            payouts_enabled: object
                .get("payouts_enabled")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        },
        other => GatewayEvent::Other {
            event_type: other.to_string(),
        },
    };
    Ok(event)
}

fn string_field(object: &serde_json::Value, key: &str) -> Result<String, GatewayError> {
    object
        .get(key)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| GatewayError::Decode(format!("event object missing {}", key)))
}

fn metadata_field(object: &serde_json::Value) -> HashMap<String, String> {
    object
        .get("metadata")
        .and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    fn succeeded_payload() -> Vec<u8> {
        serde_json::json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": { "object": {
                "id": "pi_123",
                "metadata": { "contract_id": "c-1" }
            }}
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_valid_signature_round_trip() {
        let verifier = WebhookVerifier::new(SECRET);
        let payload = succeeded_payload();
        let now = chrono::Utc::now().timestamp();
        let header = verifier.sign(&payload, now);

        let event = verifier.verify(&payload, &header).unwrap();
        match event {
            GatewayEvent::PaymentIntentSucceeded { intent_ref, metadata } => {
                assert_eq!(intent_ref, "pi_123");
                assert_eq!(metadata.get("contract_id").map(String::as_str), Some("c-1"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let verifier = WebhookVerifier::new(SECRET);
        let payload = succeeded_payload();
        let header = verifier.sign(&payload, chrono::Utc::now().timestamp());

        let mut tampered = payload.clone();
        tampered[10] ^= 1;
        assert!(matches!(
            verifier.verify(&tampered, &header),
            Err(GatewayError::Signature(_))
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = succeeded_payload();
        let header = WebhookVerifier::new("whsec_other")
            .sign(&payload, chrono::Utc::now().timestamp());
        assert!(WebhookVerifier::new(SECRET).verify(&payload, &header).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let verifier = WebhookVerifier::new(SECRET);
        let payload = succeeded_payload();
        let stale = chrono::Utc::now().timestamp() - 3600;
        let header = verifier.sign(&payload, stale);
        assert!(matches!(
            verifier.verify(&payload, &header),
            Err(GatewayError::Signature(_))
        ));
    }

    #[test]
    fn test_malformed_header_rejected() {
        let verifier = WebhookVerifier::new(SECRET);
        let payload = succeeded_payload();
        assert!(verifier.verify(&payload, "v1=abc").is_err());
        assert!(verifier.verify(&payload, "t=notanumber,v1=abc").is_err());
        assert!(verifier.verify(&payload, "").is_err());
    }

    #[test]
    fn test_unknown_event_decodes_as_other() {
        let verifier = WebhookVerifier::new(SECRET).with_tolerance(i64::MAX);
        let payload = serde_json::json!({
            "type": "charge.refunded",
            "data": { "object": { "id": "ch_1" } }
        })
        .to_string()
        .into_bytes();
        let header = verifier.sign(&payload, chrono::Utc::now().timestamp());
        assert_eq!(
            verifier.verify(&payload, &header).unwrap(),
            GatewayEvent::Other { event_type: "charge.refunded".into() }
        );
    }
}
