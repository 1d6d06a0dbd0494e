//! Card processor webhook authentication and parsing.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("missing or malformed signature header")]
    MalformedHeader,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    BadSignature,
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),
}

/// The part of a payment intent event the order machine acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntentEvent {
    pub event_id: String,
    pub kind: PaymentIntentEventKind,
    pub intent_id: String,
    pub amount_received: Option<i64>,
    pub failure_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentIntentEventKind {
    Succeeded,
    Failed,
    /// Any event type the order machine ignores.
    Other,
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawData,
}

#[derive(Deserialize)]
struct RawData {
    object: RawObject,
}

#[derive(Deserialize)]
struct RawObject {
    id: String,
    #[serde(default)]
    amount_received: Option<i64>,
    #[serde(default)]
    last_payment_error: Option<RawError>,
}

#[derive(Deserialize)]
struct RawError {
    #[serde(default)]
    message: Option<String>,
}

/// Computes the `v1` signature for `timestamp.payload`.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, WebhookError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::BadSignature)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks a `Stripe-Signature: t=...,v1=...` header against the raw body.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<(), WebhookError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        let mut it = part.trim().splitn(2, '=');
        match (it.next(), it.next()) {
            (Some("t"), Some(value)) => timestamp = value.parse::<i64>().ok(),
            (Some("v1"), Some(value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(WebhookError::MalformedHeader)?;
    if signatures.is_empty() {
        return Err(WebhookError::MalformedHeader);
    }
    let tolerance = u64::try_from(tolerance_secs).unwrap_or(0);
    if now.abs_diff(timestamp) > tolerance {
        return Err(WebhookError::Expired);
    }

    let expected = sign_payload(secret, timestamp, payload)?;
    if signatures
        .iter()
        .any(|sig| constant_time_eq(expected.as_bytes(), sig.as_bytes()))
    {
        Ok(())
    } else {
        Err(WebhookError::BadSignature)
    }
}

pub fn parse_payment_intent_event(payload: &[u8]) -> Result<PaymentIntentEvent, WebhookError> {
    let raw: RawEvent = serde_json::from_slice(payload)
        .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
    let kind = match raw.event_type.as_str() {
        "payment_intent.succeeded" => PaymentIntentEventKind::Succeeded,
        "payment_intent.payment_failed" => PaymentIntentEventKind::Failed,
        _ => PaymentIntentEventKind::Other,
    };
    Ok(PaymentIntentEvent {
        event_id: raw.id,
        kind,
        intent_id: raw.data.object.id,
        amount_received: raw.data.object.amount_received,
        failure_message: raw.data.object.last_payment_error.and_then(|e| e.message),
    })
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.iter().zip(b) {
        res |= x ^ y;
    }
    res == 0
}
