use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use tracing::{debug, instrument, warn};

use super::{
    error_for_status, format_minor_units, GatewayError, GatewayPaymentStatus, GatewayProvider,
    GatewayReference, IntentRequest, PaymentGateway, PaymentIntent, RefundRequest,
};
use crate::config::PayPalConfig;

/// Wallet payments through the PayPal payments API.
#[derive(Clone)]
pub struct PayPalGateway {
    client: reqwest::Client,
    config: PayPalConfig,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct PaymentResource {
    id: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    links: Vec<Link>,
    #[serde(default)]
    transactions: Vec<Transaction>,
    #[serde(default)]
    failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Transaction {
    #[serde(default)]
    amount: Option<Amount>,
    #[serde(default)]
    related_resources: Vec<RelatedResource>,
}

#[derive(Debug, Deserialize)]
struct Amount {
    total: String,
}

#[derive(Debug, Deserialize)]
struct RelatedResource {
    #[serde(default)]
    sale: Option<Sale>,
}

#[derive(Debug, Deserialize)]
struct Sale {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RefundResource {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PayPalErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl PayPalGateway {
    pub fn new(client: reqwest::Client, config: PayPalConfig) -> Self {
        Self { client, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url().trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        let response = self
            .client
            .post(self.url("/v1/oauth2/token"))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        let token: TokenResponse = Self::read(response).await?;
        Ok(token.access_token)
    }

    async fn read<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<PayPalErrorBody>(&body)
            .ok()
            .and_then(|e| e.message.or(e.error_description))
            .unwrap_or_else(|| format!("HTTP {}", status));
        warn!(status = %status, message = %message, "PayPal request failed");
        Err(error_for_status(status, message))
    }
}

/// Reads the outcome of an executed payment.
fn execution_status(payment: PaymentResource) -> Result<GatewayPaymentStatus, GatewayError> {
    match payment.state.as_deref() {
        Some("approved") => {
            let transaction = payment.transactions.first();
            let sale_id = transaction
                .and_then(|t| t.related_resources.iter().find_map(|r| r.sale.as_ref()))
                .map(|sale| sale.id.clone())
                .ok_or_else(|| {
                    GatewayError::InvalidResponse(format!(
                        "approved payment {} carries no sale",
                        payment.id
                    ))
                })?;
            let amount_minor = transaction
                .and_then(|t| t.amount.as_ref())
                .and_then(|a| Decimal::from_str(&a.total).ok())
                .and_then(|total| (total * Decimal::ONE_HUNDRED).to_i64());
            Ok(GatewayPaymentStatus::Succeeded {
                transaction_id: sale_id,
                amount_minor,
            })
        }
        Some("created") => Ok(GatewayPaymentStatus::Processing),
        other => Ok(GatewayPaymentStatus::Failed {
            reason: payment
                .failure_reason
                .unwrap_or_else(|| format!("payment state is {}", other.unwrap_or("unknown"))),
        }),
    }
}

#[async_trait]
impl PaymentGateway for PayPalGateway {
    fn provider(&self) -> GatewayProvider {
        GatewayProvider::PayPal
    }

    #[instrument(skip(self, request), fields(order_id = %request.order_id, amount = request.amount_minor))]
    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayError> {
        let token = self.access_token().await?;
        let body = json!({
            "intent": "sale",
            "payer": { "payment_method": "paypal" },
            "redirect_urls": {
                "return_url": self.config.return_url,
                "cancel_url": self.config.cancel_url,
            },
            "transactions": [{
                "amount": {
                    "total": format_minor_units(request.amount_minor),
                    "currency": request.currency,
                },
                "description": request.description,
                "invoice_number": request.tracking_number,
            }],
        });

        let response = self
            .client
            .post(self.url("/v1/payments/payment"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let payment: PaymentResource = Self::read(response).await?;

        let approval_url = payment
            .links
            .iter()
            .find(|link| link.rel == "approval_url")
            .map(|link| link.href.clone())
            .ok_or_else(|| {
                GatewayError::InvalidResponse(format!(
                    "payment {} has no approval_url link",
                    payment.id
                ))
            })?;
        debug!(payment_id = %payment.id, "PayPal payment created");

        Ok(PaymentIntent {
            provider: GatewayProvider::PayPal,
            intent_id: payment.id,
            client_secret: None,
            approval_url: Some(approval_url),
        })
    }

    #[instrument(skip(self), fields(intent_id = %reference.intent_id))]
    async fn verify_payment(
        &self,
        reference: &GatewayReference,
    ) -> Result<GatewayPaymentStatus, GatewayError> {
        let payer_id = reference.payer_id.as_deref().ok_or_else(|| {
            GatewayError::InvalidRequest("payer_id is required to execute a PayPal payment".into())
        })?;

        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.url(&format!(
                "/v1/payments/payment/{}/execute",
                reference.intent_id
            )))
            .bearer_auth(token)
            .json(&json!({ "payer_id": payer_id }))
            .send()
            .await?;
        let payment: PaymentResource = Self::read(response).await?;
        execution_status(payment)
    }

    #[instrument(skip(self), fields(transaction_id = %request.transaction_id))]
    async fn refund(&self, request: &RefundRequest) -> Result<String, GatewayError> {
        let token = self.access_token().await?;
        let body = match request.amount_minor {
            Some(amount) => json!({
                "amount": {
                    "total": format_minor_units(amount),
                    "currency": request.currency,
                }
            }),
            None => json!({}),
        };

        let response = self
            .client
            .post(self.url(&format!(
                "/v1/payments/sale/{}/refund",
                request.transaction_id
            )))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let refund: RefundResource = Self::read(response).await?;
        Ok(refund.id)
    }
}
