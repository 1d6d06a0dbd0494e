use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::{
    error_for_status, GatewayError, GatewayPaymentStatus, GatewayProvider, GatewayReference,
    IntentRequest, PaymentGateway, PaymentIntent, RefundRequest,
};
use crate::config::StripeConfig;

const REFUND_REASONS: [&str; 3] = ["duplicate", "fraudulent", "requested_by_customer"];

/// Card payments through Stripe payment intents.
#[derive(Clone)]
pub struct StripeGateway {
    client: reqwest::Client,
    config: StripeConfig,
}

#[derive(Debug, Deserialize)]
struct StripeIntent {
    id: String,
    status: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    amount_received: Option<i64>,
    #[serde(default)]
    last_payment_error: Option<StripeErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorBody,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    #[serde(default)]
    message: Option<String>,
}

impl StripeGateway {
    pub fn new(client: reqwest::Client, config: StripeConfig) -> Self {
        Self { client, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn read<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<StripeErrorEnvelope>(&body)
            .ok()
            .and_then(|e| e.error.message)
            .unwrap_or_else(|| format!("HTTP {}", status));
        warn!(status = %status, message = %message, "Stripe request failed");
        Err(error_for_status(status, message))
    }
}

/// Maps a payment intent status onto the adapter's view of it.
fn intent_status(intent: StripeIntent) -> GatewayPaymentStatus {
    match intent.status.as_str() {
        "succeeded" => GatewayPaymentStatus::Succeeded {
            transaction_id: intent.id,
            amount_minor: intent.amount_received,
        },
        "processing" | "requires_action" | "requires_confirmation" | "requires_capture" => {
            GatewayPaymentStatus::Processing
        }
        other => GatewayPaymentStatus::Failed {
            reason: intent
                .last_payment_error
                .and_then(|e| e.message)
                .unwrap_or_else(|| format!("payment intent is {}", other)),
        },
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider(&self) -> GatewayProvider {
        GatewayProvider::Stripe
    }

    #[instrument(skip(self, request), fields(order_id = %request.order_id, amount = request.amount_minor))]
    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayError> {
        let mut params = vec![
            ("amount", request.amount_minor.to_string()),
            ("currency", request.currency.to_lowercase()),
            ("description", request.description.clone()),
            ("metadata[order_id]", request.order_id.to_string()),
            ("metadata[tracking_number]", request.tracking_number.clone()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
        ];
        if let Some(email) = &request.receipt_email {
            params.push(("receipt_email", email.clone()));
        }

        let response = self
            .client
            .post(self.url("/v1/payment_intents"))
            .bearer_auth(&self.config.secret_key)
            .form(&params)
            .send()
            .await?;
        let intent: StripeIntent = Self::read(response).await?;
        debug!(intent_id = %intent.id, "Stripe payment intent created");

        Ok(PaymentIntent {
            provider: GatewayProvider::Stripe,
            intent_id: intent.id,
            client_secret: intent.client_secret,
            approval_url: None,
        })
    }

    #[instrument(skip(self), fields(intent_id = %reference.intent_id))]
    async fn verify_payment(
        &self,
        reference: &GatewayReference,
    ) -> Result<GatewayPaymentStatus, GatewayError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/payment_intents/{}", reference.intent_id)))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;
        let intent: StripeIntent = Self::read(response).await?;
        Ok(intent_status(intent))
    }

    #[instrument(skip(self), fields(transaction_id = %request.transaction_id))]
    async fn refund(&self, request: &RefundRequest) -> Result<String, GatewayError> {
        let mut params = vec![("payment_intent", request.transaction_id.clone())];
        if let Some(amount) = request.amount_minor {
            params.push(("amount", amount.to_string()));
        }
        if let Some(reason) = &request.reason {
            if REFUND_REASONS.contains(&reason.as_str()) {
                params.push(("reason", reason.clone()));
            } else {
                params.push(("metadata[reason]", reason.clone()));
            }
        }

        let response = self
            .client
            .post(self.url("/v1/refunds"))
            .bearer_auth(&self.config.secret_key)
            .form(&params)
            .send()
            .await?;
        let refund: StripeRefund = Self::read(response).await?;
        Ok(refund.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(status: &str) -> StripeIntent {
        StripeIntent {
            id: "pi_123".into(),
            status: status.into(),
            client_secret: None,
            amount_received: Some(2000),
            last_payment_error: None,
        }
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            intent_status(intent("succeeded")),
            GatewayPaymentStatus::Succeeded {
                transaction_id: "pi_123".into(),
                amount_minor: Some(2000)
            }
        );
        assert_eq!(
            intent_status(intent("processing")),
            GatewayPaymentStatus::Processing
        );
        assert_eq!(
            intent_status(intent("requires_action")),
            GatewayPaymentStatus::Processing
        );
        assert!(matches!(
            intent_status(intent("canceled")),
            GatewayPaymentStatus::Failed { .. }
        ));
        assert!(matches!(
            intent_status(intent("requires_payment_method")),
            GatewayPaymentStatus::Failed { .. }
        ));
    }
}
