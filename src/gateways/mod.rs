//! Instant-family payment processors.
//!
//! Each processor is a [`PaymentGateway`] built once from explicit config and an
//! injected HTTP client, then shared behind an `Arc`.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub mod paypal;
pub mod stripe;
pub mod webhook;

pub use paypal::PayPalGateway;
pub use stripe::StripeGateway;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment gateway request failed: {0}")]
    Transport(String),

    #[error("payment gateway rejected the request: {0}")]
    Rejected(String),

    #[error("payment gateway unavailable (HTTP {0})")]
    Unavailable(u16),

    #[error("unexpected payment gateway response: {0}")]
    InvalidResponse(String),

    #[error("invalid payment gateway request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::InvalidResponse(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GatewayProvider {
    Stripe,
    PayPal,
}

/// Amount to charge for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentRequest {
    pub order_id: Uuid,
    pub tracking_number: String,
    /// Minor units (cents).
    pub amount_minor: i64,
    /// Uppercase ISO 4217 code.
    pub currency: String,
    pub description: String,
    pub receipt_email: Option<String>,
}

/// A processor-side payment object the buyer completes client-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub provider: GatewayProvider,
    pub intent_id: String,
    /// Card flow: secret handed to the browser SDK.
    pub client_secret: Option<String>,
    /// Wallet flow: where to send the buyer for approval.
    pub approval_url: Option<String>,
}

/// Identifies a payment to confirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayReference {
    pub intent_id: String,
    /// Wallet flow only.
    pub payer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayPaymentStatus {
    Succeeded {
        transaction_id: String,
        amount_minor: Option<i64>,
    },
    /// Still being authorised; nothing to record yet.
    Processing,
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub transaction_id: String,
    /// Full refund when `None`.
    pub amount_minor: Option<i64>,
    pub currency: String,
    pub reason: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> GatewayProvider;

    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayError>;

    async fn verify_payment(
        &self,
        reference: &GatewayReference,
    ) -> Result<GatewayPaymentStatus, GatewayError>;

    /// Returns the processor's refund id.
    async fn refund(&self, request: &RefundRequest) -> Result<String, GatewayError>;
}

/// Converts a decimal amount into minor units, rejecting fractions of a cent.
pub fn to_minor_units(amount: Decimal) -> Result<i64, GatewayError> {
    let scaled = amount * Decimal::ONE_HUNDRED;
    if scaled.fract() != Decimal::ZERO {
        return Err(GatewayError::InvalidRequest(format!(
            "amount {} has more than two decimal places",
            amount
        )));
    }
    scaled
        .to_i64()
        .ok_or_else(|| GatewayError::InvalidRequest(format!("amount {} is out of range", amount)))
}

/// Renders minor units as a decimal string, e.g. `2050` as `"20.50"`.
pub fn format_minor_units(amount_minor: i64) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let abs = amount_minor.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Shared HTTP client for processor calls.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, GatewayError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(GatewayError::from)
}

/// Maps a non-success HTTP status and body into a gateway error.
pub(crate) fn error_for_status(status: reqwest::StatusCode, message: String) -> GatewayError {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        GatewayError::Unavailable(status.as_u16())
    } else {
        GatewayError::Rejected(message)
    }
}
