//! Payment capture for orders.
//!
//! [`PaymentGatewayAdapter`] turns processor responses and manual receipts into a
//! [`PaymentOutcome`]; [`PaymentService`] feeds those outcomes through the order state
//! machine. Processor calls never run inside a database transaction: the order is read,
//! the processor is called, and the result is committed against the version read first.

use crate::{
    auth::Actor,
    config::{AppConfig, PaymentsConfig},
    db::DbPool,
    entities::{
        order::{
            self, Entity as OrderEntity, Model as OrderModel, PaymentFamily, PaymentMethod,
            PaymentStatus,
        },
        order_note::{ActiveModel as OrderNoteActiveModel, NoteKind},
    },
    errors::ServiceError,
    events::{publish, Event, EventSender},
    gateways::{
        build_http_client, to_minor_units,
        webhook::{parse_payment_intent_event, verify_signature, PaymentIntentEventKind, WebhookError},
        GatewayPaymentStatus, GatewayReference, IntentRequest, PayPalGateway, PaymentGateway,
        PaymentIntent, RefundRequest, StripeGateway,
    },
    services::{
        codes::CodeGenerator,
        listings::ListingService,
        order_status::{
            commit_order_changes, load_order, no_changes, state_changes, transition, OrderEvent,
            OrderState,
        },
        orders::{attach_codes, codes_due, load_user},
    },
};
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// What the buyer hands over as evidence of payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum PaymentProof {
    /// A processor-side payment the buyer completed.
    Instant {
        intent_id: String,
        payer_id: Option<String>,
    },
    /// A transfer reference typed in by the buyer, optionally with a receipt.
    Manual {
        reference: String,
        receipt_url: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentOutcome {
    Paid { transaction_id: String },
    ManualReview,
    Failed { reason: String },
    /// The processor has not settled yet; nothing changes on the order.
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstantConfirmation {
    pub intent_id: String,
    pub payer_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualPaymentSubmission {
    pub method: String,
    pub reference: String,
    pub receipt_url: Option<String>,
}

/// Result of a processor webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookDisposition {
    Applied { order_id: Uuid, outcome: PaymentOutcome },
    Ignored { reason: String },
}

/// The configured instant-family processors.
#[derive(Clone, Default)]
pub struct PaymentGateways {
    stripe: Option<Arc<dyn PaymentGateway>>,
    paypal: Option<Arc<dyn PaymentGateway>>,
}

impl PaymentGateways {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stripe(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.stripe = Some(gateway);
        self
    }

    pub fn with_paypal(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.paypal = Some(gateway);
        self
    }

    /// Builds one shared HTTP client and a gateway for each configured processor.
    pub fn from_config(config: &PaymentsConfig) -> Result<Self, ServiceError> {
        let client = build_http_client(Duration::from_secs(config.request_timeout_secs))?;
        let mut gateways = Self::new();
        if let Some(stripe) = &config.stripe {
            gateways = gateways.with_stripe(Arc::new(StripeGateway::new(
                client.clone(),
                stripe.clone(),
            )));
        }
        if let Some(paypal) = &config.paypal {
            gateways =
                gateways.with_paypal(Arc::new(PayPalGateway::new(client, paypal.clone())));
        }
        Ok(gateways)
    }

    fn for_method(&self, method: PaymentMethod) -> Result<&Arc<dyn PaymentGateway>, ServiceError> {
        let gateway = match method {
            PaymentMethod::Stripe => self.stripe.as_ref(),
            PaymentMethod::PayPal => self.paypal.as_ref(),
            _ => None,
        };
        gateway.ok_or_else(|| {
            ServiceError::invalid(
                "payment_method",
                format!("{} is not available", method.display_name()),
            )
        })
    }
}

fn order_amount_minor(order: &OrderModel) -> Result<i64, ServiceError> {
    to_minor_units(order.purchase_price).map_err(|e| {
        ServiceError::InternalError(format!("Order {} has an unusable price: {}", order.id, e))
    })
}

/// Normalizes both payment families into a [`PaymentOutcome`].
#[derive(Clone)]
pub struct PaymentGatewayAdapter {
    gateways: PaymentGateways,
}

impl PaymentGatewayAdapter {
    pub fn new(gateways: PaymentGateways) -> Self {
        Self { gateways }
    }

    /// Asks the processor about an instant payment, or accepts a manual receipt for review.
    ///
    /// Processor failures come back as `ExternalServiceError`; the caller leaves the
    /// order as it was.
    #[instrument(skip(self, order, proof), fields(order_id = %order.id, method = %method))]
    pub async fn capture(
        &self,
        order: &OrderModel,
        method: PaymentMethod,
        proof: &PaymentProof,
    ) -> Result<PaymentOutcome, ServiceError> {
        match (method.family(), proof) {
            (PaymentFamily::Instant, PaymentProof::Instant { intent_id, payer_id }) => {
                let gateway = self.gateways.for_method(method)?;
                let status = gateway
                    .verify_payment(&GatewayReference {
                        intent_id: intent_id.clone(),
                        payer_id: payer_id.clone(),
                    })
                    .await
                    .map_err(|e| {
                        warn!(error = %e, order_id = %order.id, "Payment verification failed");
                        ServiceError::from(e)
                    })?;
                Self::outcome_for(order, status)
            }
            (PaymentFamily::Manual, PaymentProof::Manual { reference, .. }) => {
                if reference.trim().is_empty() {
                    return Err(ServiceError::invalid("reference", "is required"));
                }
                Ok(PaymentOutcome::ManualReview)
            }
            (family, _) => Err(ServiceError::invalid(
                "payment_method",
                format!("{} requires {} payment proof", method, family),
            )),
        }
    }

    /// Maps a processor status onto an outcome, refusing amounts that differ from the order.
    pub fn outcome_for(
        order: &OrderModel,
        status: GatewayPaymentStatus,
    ) -> Result<PaymentOutcome, ServiceError> {
        Ok(match status {
            GatewayPaymentStatus::Succeeded {
                transaction_id,
                amount_minor,
            } => {
                let expected = order_amount_minor(order)?;
                match amount_minor {
                    Some(received) if received != expected => {
                        warn!(order_id = %order.id, expected, received, "Captured amount does not match order");
                        PaymentOutcome::Failed {
                            reason: format!(
                                "Captured amount {} does not match order amount {}",
                                received, expected
                            ),
                        }
                    }
                    _ => PaymentOutcome::Paid { transaction_id },
                }
            }
            GatewayPaymentStatus::Processing => PaymentOutcome::Pending,
            GatewayPaymentStatus::Failed { reason } => PaymentOutcome::Failed { reason },
        })
    }

    pub async fn create_intent(
        &self,
        method: PaymentMethod,
        request: &IntentRequest,
    ) -> Result<PaymentIntent, ServiceError> {
        let gateway = self.gateways.for_method(method)?;
        Ok(gateway.create_intent(request).await?)
    }

    pub async fn refund(
        &self,
        method: PaymentMethod,
        request: &RefundRequest,
    ) -> Result<String, ServiceError> {
        let gateway = self.gateways.for_method(method)?;
        Ok(gateway.refund(request).await?)
    }
}

/// Limits the payment service enforces, taken from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct PaymentSettings {
    pub minimum_charge_minor: i64,
    pub max_note_length: usize,
    pub max_reference_length: usize,
    pub code_length: usize,
    pub webhook_secret: Option<String>,
    pub webhook_tolerance_secs: i64,
}

impl From<&AppConfig> for PaymentSettings {
    fn from(config: &AppConfig) -> Self {
        let stripe = config.payments.stripe.as_ref();
        Self {
            minimum_charge_minor: config.payments.minimum_charge_minor,
            max_note_length: config.max_note_length,
            max_reference_length: config.max_reference_length,
            code_length: config.verification.code_length,
            webhook_secret: stripe.and_then(|s| s.webhook_secret.clone()),
            webhook_tolerance_secs: stripe.map(|s| s.webhook_tolerance_secs).unwrap_or(300),
        }
    }
}

/// Appends an administrator rejection to the order note, keeping at most `max_len` characters.
///
/// Truncation drops from the end, so the column keeps the oldest text and a note
/// already at the cap gains nothing. The full reason is always in `order_notes`.
pub fn append_rejection_note(
    current: Option<&str>,
    reason: &str,
    at: DateTime<Utc>,
    max_len: usize,
) -> String {
    let entry = format!(
        "\n\n[ADMIN REJECTION - {}]\n{}",
        at.format("%Y-%m-%d %H:%M"),
        reason
    );
    let combined = format!("{}{}", current.unwrap_or_default(), entry);
    combined.chars().take(max_len).collect()
}

fn ensure_buyer(order: &OrderModel, actor: &Actor) -> Result<(), ServiceError> {
    if order.buyer_id != actor.user_id {
        return Err(ServiceError::Forbidden(
            "Only the buyer may pay for this order".to_string(),
        ));
    }
    Ok(())
}

fn ensure_currency(currency: &str) -> Result<(), ServiceError> {
    if currency.len() == 3 && currency.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(ServiceError::invalid(
            "currency",
            format!("'{}' is not a 3-letter currency code", currency),
        ))
    }
}

async fn record_note<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    author_id: Uuid,
    kind: NoteKind,
    body: String,
) -> Result<(), ServiceError> {
    OrderNoteActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        author_id: Set(author_id),
        kind: Set(kind),
        body: Set(body),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?;
    Ok(())
}

#[derive(Clone)]
pub struct PaymentService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
    adapter: Arc<PaymentGatewayAdapter>,
    settings: PaymentSettings,
}

impl PaymentService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
        adapter: Arc<PaymentGatewayAdapter>,
        settings: PaymentSettings,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            adapter,
            settings,
        }
    }

    fn code_generator(&self) -> CodeGenerator {
        CodeGenerator::new(self.settings.code_length)
    }

    /// Opens a processor payment for the order and remembers its id.
    #[instrument(skip(self), fields(buyer_id = %actor.user_id))]
    pub async fn start_instant_payment(
        &self,
        actor: &Actor,
        order_id: Uuid,
        method: &str,
    ) -> Result<PaymentIntent, ServiceError> {
        let method = PaymentMethod::parse(method)?;
        if method.family() != PaymentFamily::Instant {
            return Err(ServiceError::invalid(
                "payment_method",
                format!("{} is not an instant payment method", method),
            ));
        }

        let db = &*self.db_pool;
        let order = load_order(db, order_id).await?;
        ensure_buyer(&order, actor)?;
        transition(OrderState::of(&order), OrderEvent::InstantPaymentSucceeded)?;

        let amount_minor = order_amount_minor(&order)?;
        if amount_minor < self.settings.minimum_charge_minor {
            return Err(ServiceError::invalid(
                "amount",
                format!(
                    "must be at least {} minor units, got {}",
                    self.settings.minimum_charge_minor, amount_minor
                ),
            ));
        }
        ensure_currency(&order.currency)?;
        let buyer = load_user(db, order.buyer_id).await?;

        let intent = self
            .adapter
            .create_intent(
                method,
                &IntentRequest {
                    order_id: order.id,
                    tracking_number: order.tracking_number.clone(),
                    amount_minor,
                    currency: order.currency.clone(),
                    description: format!("Luggage space order {}", order.tracking_number),
                    receipt_email: Some(buyer.email),
                },
            )
            .await?;

        let txn = db.begin().await?;
        let mut changes = no_changes();
        changes.gateway_intent_id = Set(Some(intent.intent_id.clone()));
        changes.payment_method = Set(Some(method));
        commit_order_changes(&txn, &order, changes).await?;
        txn.commit().await?;

        info!(order_id = %order_id, provider = %intent.provider, intent_id = %intent.intent_id, "Payment intent created");
        publish(
            &self.event_sender,
            Event::PaymentIntentCreated {
                order_id,
                provider: intent.provider,
            },
        )
        .await;
        Ok(intent)
    }

    /// Checks the recorded processor payment and applies its outcome.
    #[instrument(skip(self, confirmation), fields(buyer_id = %actor.user_id))]
    pub async fn confirm_instant_payment(
        &self,
        actor: &Actor,
        order_id: Uuid,
        confirmation: InstantConfirmation,
    ) -> Result<PaymentOutcome, ServiceError> {
        let order = load_order(&*self.db_pool, order_id).await?;
        ensure_buyer(&order, actor)?;

        let method = order
            .payment_method
            .filter(|m| m.family() == PaymentFamily::Instant)
            .ok_or_else(|| {
                ServiceError::StateConflict("No instant payment has been started".to_string())
            })?;
        if order.gateway_intent_id.as_deref() != Some(confirmation.intent_id.as_str()) {
            return Err(ServiceError::invalid(
                "intent_id",
                "does not match the payment started for this order",
            ));
        }
        transition(OrderState::of(&order), OrderEvent::InstantPaymentSucceeded)?;

        let outcome = self
            .adapter
            .capture(
                &order,
                method,
                &PaymentProof::Instant {
                    intent_id: confirmation.intent_id,
                    payer_id: confirmation.payer_id,
                },
            )
            .await?;

        self.apply_instant_outcome(&order, &outcome).await?;
        Ok(outcome)
    }

    /// Commits an instant-family outcome against the order as it was read before the
    /// processor call.
    async fn apply_instant_outcome(
        &self,
        order: &OrderModel,
        outcome: &PaymentOutcome,
    ) -> Result<Option<OrderModel>, ServiceError> {
        let (event, transaction_id) = match outcome {
            PaymentOutcome::Paid { transaction_id } => {
                (OrderEvent::InstantPaymentSucceeded, Some(transaction_id.clone()))
            }
            PaymentOutcome::Failed { .. } => (OrderEvent::InstantPaymentFailed, None),
            PaymentOutcome::Pending => {
                info!(order_id = %order.id, "Payment still processing");
                return Ok(None);
            }
            PaymentOutcome::ManualReview => {
                return Err(ServiceError::InternalError(
                    "Instant payment produced a manual review outcome".to_string(),
                ))
            }
        };

        let next = transition(OrderState::of(order), event)?;
        let mut changes = state_changes(next);
        let issue = codes_due(order, next.payment_status, order.sender_id_url.is_some());
        if let Some(transaction_id) = &transaction_id {
            changes.payment_transaction_id = Set(Some(transaction_id.clone()));
        }
        if issue {
            attach_codes(&mut changes, &self.code_generator());
        }

        let txn = self.db_pool.begin().await?;
        let updated = commit_order_changes(&txn, order, changes).await?;
        txn.commit().await?;

        match (outcome, transaction_id) {
            (PaymentOutcome::Paid { .. }, Some(transaction_id)) => {
                counter!("maa.payments.captured", 1);
                info!(order_id = %order.id, transaction_id = %transaction_id, "Instant payment captured");
                publish(
                    &self.event_sender,
                    Event::PaymentCaptured {
                        order_id: order.id,
                        transaction_id,
                    },
                )
                .await;
            }
            (PaymentOutcome::Failed { reason }, _) => {
                counter!("maa.payments.failed", 1);
                warn!(order_id = %order.id, reason = %reason, "Instant payment failed");
                publish(&self.event_sender, Event::PaymentFailed(order.id)).await;
            }
            _ => {}
        }
        if issue {
            publish(&self.event_sender, Event::VerificationCodesIssued(order.id)).await;
        }
        Ok(Some(updated))
    }

    /// Records an off-platform transfer for administrator review.
    ///
    /// A later submission replaces every manual-payment field of an earlier one.
    #[instrument(skip(self, submission), fields(buyer_id = %actor.user_id))]
    pub async fn submit_manual_payment(
        &self,
        actor: &Actor,
        order_id: Uuid,
        submission: ManualPaymentSubmission,
    ) -> Result<OrderModel, ServiceError> {
        let method = PaymentMethod::parse(&submission.method)?;
        if method.family() != PaymentFamily::Manual {
            return Err(ServiceError::invalid(
                "payment_method",
                format!("{} is not a manual payment method", method),
            ));
        }
        let reference = submission.reference.trim().to_string();
        if reference.is_empty() {
            return Err(ServiceError::invalid("reference", "is required"));
        }
        if reference.chars().count() > self.settings.max_reference_length {
            return Err(ServiceError::invalid("reference", "is too long"));
        }
        let receipt_url = submission
            .receipt_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        if let Some(url) = &receipt_url {
            if url.chars().count() > self.settings.max_reference_length {
                return Err(ServiceError::invalid("receipt_url", "is too long"));
            }
        }

        let txn = self.db_pool.begin().await?;
        let order = load_order(&txn, order_id).await?;
        ensure_buyer(&order, actor)?;

        let proof = PaymentProof::Manual {
            reference: reference.clone(),
            receipt_url: receipt_url.clone(),
        };
        let outcome = self.adapter.capture(&order, method, &proof).await?;
        if outcome != PaymentOutcome::ManualReview {
            return Err(ServiceError::InternalError(
                "Manual payment did not enter review".to_string(),
            ));
        }

        let next = transition(OrderState::of(&order), OrderEvent::ManualPaymentSubmitted)?;
        let mut changes = state_changes(next);
        changes.payment_method = Set(Some(method));
        changes.payment_reference = Set(Some(reference));
        changes.payment_receipt_url = Set(receipt_url);
        changes.payment_transaction_id = Set(None);
        changes.gateway_intent_id = Set(None);

        let updated = commit_order_changes(&txn, &order, changes).await?;
        txn.commit().await?;

        counter!("maa.payments.manual_submitted", 1);
        info!(order_id = %order_id, method = %method, "Manual payment submitted for review");
        publish(
            &self.event_sender,
            Event::ManualPaymentSubmitted { order_id, method },
        )
        .await;
        Ok(updated)
    }

    #[instrument(skip(self), fields(admin_id = %actor.user_id))]
    pub async fn approve_manual_payment(
        &self,
        actor: &Actor,
        order_id: Uuid,
    ) -> Result<OrderModel, ServiceError> {
        actor.require_admin()?;

        let txn = self.db_pool.begin().await?;
        let order = load_order(&txn, order_id).await?;
        let next = transition(OrderState::of(&order), OrderEvent::ManualPaymentApproved)?;

        let mut changes = state_changes(next);
        changes.payment_transaction_id = Set(order.payment_reference.clone());
        let issue = codes_due(&order, next.payment_status, order.sender_id_url.is_some());
        if issue {
            attach_codes(&mut changes, &self.code_generator());
        }

        let updated = commit_order_changes(&txn, &order, changes).await?;
        txn.commit().await?;

        counter!("maa.payments.manual_approved", 1);
        info!(order_id = %order_id, codes_issued = issue, "Manual payment approved");
        publish(&self.event_sender, Event::PaymentApproved(order_id)).await;
        if issue {
            publish(&self.event_sender, Event::VerificationCodesIssued(order_id)).await;
        }
        Ok(updated)
    }

    #[instrument(skip(self, reason), fields(admin_id = %actor.user_id))]
    pub async fn reject_manual_payment(
        &self,
        actor: &Actor,
        order_id: Uuid,
        reason: &str,
    ) -> Result<OrderModel, ServiceError> {
        actor.require_admin()?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ServiceError::invalid("reason", "a rejection reason is required"));
        }

        let txn = self.db_pool.begin().await?;
        let order = load_order(&txn, order_id).await?;
        let next = transition(OrderState::of(&order), OrderEvent::ManualPaymentRejected)?;

        let mut changes = state_changes(next);
        changes.note = Set(Some(append_rejection_note(
            order.note.as_deref(),
            reason,
            Utc::now(),
            self.settings.max_note_length,
        )));

        let updated = commit_order_changes(&txn, &order, changes).await?;
        record_note(
            &txn,
            order_id,
            actor.user_id,
            NoteKind::PaymentRejection,
            reason.to_string(),
        )
        .await?;
        txn.commit().await?;

        counter!("maa.payments.manual_rejected", 1);
        info!(order_id = %order_id, "Manual payment rejected");
        publish(
            &self.event_sender,
            Event::PaymentRejected {
                order_id,
                reason: reason.to_string(),
            },
        )
        .await;
        Ok(updated)
    }

    /// Refunds a disputed order and returns its weight to the listing.
    #[instrument(skip(self, reason), fields(admin_id = %actor.user_id))]
    pub async fn refund_payment(
        &self,
        actor: &Actor,
        order_id: Uuid,
        reason: Option<String>,
    ) -> Result<OrderModel, ServiceError> {
        actor.require_admin()?;

        let order = load_order(&*self.db_pool, order_id).await?;
        let next = transition(OrderState::of(&order), OrderEvent::PaymentRefunded)?;

        let refund_id = match order.payment_method {
            Some(method) if method.family() == PaymentFamily::Instant => {
                let transaction_id = order.payment_transaction_id.clone().ok_or_else(|| {
                    ServiceError::StateConflict(
                        "Paid order has no processor transaction to refund".to_string(),
                    )
                })?;
                let refund_id = self
                    .adapter
                    .refund(
                        method,
                        &RefundRequest {
                            transaction_id,
                            amount_minor: None,
                            currency: order.currency.clone(),
                            reason: reason.clone(),
                        },
                    )
                    .await?;
                Some(refund_id)
            }
            _ => None,
        };

        let body = match (&refund_id, &reason) {
            (Some(id), Some(reason)) => format!("Refund {} issued: {}", id, reason),
            (Some(id), None) => format!("Refund {} issued", id),
            (None, Some(reason)) => format!("Refunded outside the platform: {}", reason),
            (None, None) => "Refunded outside the platform".to_string(),
        };

        let txn = self.db_pool.begin().await?;
        let updated = commit_order_changes(&txn, &order, state_changes(next)).await?;
        ListingService::release_capacity(&txn, order.listing_id, order.purchased_weight).await?;
        record_note(&txn, order_id, actor.user_id, NoteKind::Refund, body).await?;
        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit refund");
            ServiceError::DatabaseError(e)
        })?;

        counter!("maa.payments.refunded", 1);
        info!(order_id = %order_id, refund_id = ?refund_id, "Payment refunded");
        publish(&self.event_sender, Event::PaymentRefunded(order_id)).await;
        Ok(updated)
    }

    /// Manual payments waiting for an administrator, oldest first.
    #[instrument(skip(self), fields(admin_id = %actor.user_id))]
    pub async fn pending_manual_payments(
        &self,
        actor: &Actor,
    ) -> Result<Vec<OrderModel>, ServiceError> {
        actor.require_admin()?;
        let orders = OrderEntity::find()
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::ManualReview))
            .order_by_asc(order::Column::UpdatedAt)
            .all(&*self.db_pool)
            .await?;
        Ok(orders)
    }

    /// Applies a signed card-processor notification about a payment intent.
    #[instrument(skip(self, payload, signature_header))]
    pub async fn handle_stripe_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: i64,
    ) -> Result<WebhookDisposition, ServiceError> {
        let secret = self.settings.webhook_secret.as_deref().ok_or_else(|| {
            ServiceError::InternalError("Webhook signing secret is not configured".to_string())
        })?;
        verify_signature(
            payload,
            signature_header,
            secret,
            self.settings.webhook_tolerance_secs,
            now,
        )
        .map_err(|e| match e {
            WebhookError::BadSignature | WebhookError::Expired => {
                warn!(error = %e, "Rejected webhook delivery");
                ServiceError::Forbidden(e.to_string())
            }
            other => ServiceError::ValidationError(other.to_string()),
        })?;

        let event = parse_payment_intent_event(payload)
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        let status = match event.kind {
            PaymentIntentEventKind::Succeeded => GatewayPaymentStatus::Succeeded {
                transaction_id: event.intent_id.clone(),
                amount_minor: event.amount_received,
            },
            PaymentIntentEventKind::Failed => GatewayPaymentStatus::Failed {
                reason: event
                    .failure_message
                    .clone()
                    .unwrap_or_else(|| "Payment failed".to_string()),
            },
            PaymentIntentEventKind::Other => {
                return Ok(WebhookDisposition::Ignored {
                    reason: format!("event {} is not handled", event.event_id),
                })
            }
        };

        let order = OrderEntity::find()
            .filter(order::Column::GatewayIntentId.eq(event.intent_id.clone()))
            .one(&*self.db_pool)
            .await?;
        let Some(order) = order else {
            warn!(intent_id = %event.intent_id, "Webhook for unknown payment intent");
            return Ok(WebhookDisposition::Ignored {
                reason: format!("no order holds intent {}", event.intent_id),
            });
        };

        let outcome = PaymentGatewayAdapter::outcome_for(&order, status)?;
        match self.apply_instant_outcome(&order, &outcome).await {
            Ok(_) => Ok(WebhookDisposition::Applied {
                order_id: order.id,
                outcome,
            }),
            Err(ServiceError::StateConflict(reason)) => {
                info!(order_id = %order.id, reason = %reason, "Webhook already reflected on order");
                Ok(WebhookDisposition::Ignored { reason })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rejection_note_format() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        let note = append_rejection_note(Some("earlier"), "Receipt unreadable", at, 65_000);
        assert_eq!(
            note,
            "earlier\n\n[ADMIN REJECTION - 2024-05-01 09:30]\nReceipt unreadable"
        );
    }

    #[test]
    fn rejection_note_is_capped() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        let full = "x".repeat(40);
        let note = append_rejection_note(Some(&full), "more", at, 40);
        assert_eq!(note, full);
    }

    #[test]
    fn currency_check() {
        assert!(ensure_currency("AUD").is_ok());
        assert!(ensure_currency("aud").is_err());
        assert!(ensure_currency("AUDD").is_err());
    }
}
