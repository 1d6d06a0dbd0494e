//! Seller-run handover and delivery code checks.

use crate::{
    auth::Actor,
    config::VerificationConfig,
    db::DbPool,
    entities::order::{OrderStatus, VerificationLeg},
    errors::ServiceError,
    events::{publish, Event, EventSender},
    services::{
        codes::codes_match,
        listings::load_listing,
        order_status::{
            commit_order_changes, load_order, no_changes, state_changes, transition, OrderEvent,
            OrderState,
        },
        orders::remaining_attempts,
    },
};
use chrono::Utc;
use metrics::counter;
use sea_orm::{Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct VerifyCodeRequest {
    #[validate(length(min = 1, max = 64, message = "Code is required"))]
    pub code: String,
    #[validate(length(max = 500, message = "Photo reference is too long"))]
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Success { status: OrderStatus },
    Failure { remaining_attempts: i32 },
    /// The last attempt was used up; the order is now disputed.
    Disputed,
}

impl VerificationOutcome {
    pub fn message(&self) -> String {
        match self {
            VerificationOutcome::Success {
                status: OrderStatus::InTransit,
            } => "Handover verified. The parcel is now in transit.".to_string(),
            VerificationOutcome::Success {
                status: OrderStatus::Delivered,
            } => "Delivery verified. The order is complete.".to_string(),
            VerificationOutcome::Success { status } => format!("Code verified, order is {}", status),
            VerificationOutcome::Failure { remaining_attempts } => format!(
                "Incorrect code. {} attempt{} remaining.",
                remaining_attempts,
                if *remaining_attempts == 1 { "" } else { "s" }
            ),
            VerificationOutcome::Disputed => {
                "Too many incorrect codes. The order has been marked as disputed and needs review."
                    .to_string()
            }
        }
    }
}

fn expected_status(leg: VerificationLeg) -> OrderStatus {
    match leg {
        VerificationLeg::Handover => OrderStatus::PendingHandover,
        VerificationLeg::Delivery => OrderStatus::InTransit,
    }
}

fn leg_label(leg: VerificationLeg) -> &'static str {
    match leg {
        VerificationLeg::Handover => "Handover",
        VerificationLeg::Delivery => "Delivery",
    }
}

#[derive(Clone)]
pub struct VerificationService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
    config: VerificationConfig,
}

impl VerificationService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
        config: VerificationConfig,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            config,
        }
    }

    /// Checks the code the seller typed in for one leg of the trip.
    ///
    /// A wrong code uses up one attempt; using up the last one disputes the order.
    /// Nothing is consumed when the request is rejected before the comparison.
    #[instrument(skip(self, request), fields(seller_id = %actor.user_id, order_id = %order_id, leg = %leg))]
    pub async fn verify(
        &self,
        actor: &Actor,
        order_id: Uuid,
        leg: VerificationLeg,
        request: VerifyCodeRequest,
    ) -> Result<VerificationOutcome, ServiceError> {
        request.validate()?;
        if request.code.trim().is_empty() {
            return Err(ServiceError::invalid("code", "Code is required"));
        }
        let max_attempts = self.config.max_attempts;

        let txn = self.db_pool.begin().await?;
        let order = load_order(&txn, order_id).await?;
        let listing = load_listing(&txn, order.listing_id).await?;

        if listing.seller_id != actor.user_id {
            return Err(ServiceError::Forbidden(
                "Only the listing's seller may verify codes".to_string(),
            ));
        }
        if order.status == OrderStatus::Disputed {
            if order.attempts(leg) >= max_attempts {
                return Err(ServiceError::AttemptsExhausted(order_id));
            }
            return Err(ServiceError::StateConflict(
                "Order is disputed and awaiting review".to_string(),
            ));
        }
        if order.verified_at(leg).is_some() {
            return Err(ServiceError::StateConflict(format!(
                "{} has already been verified",
                leg_label(leg)
            )));
        }
        if order.status != expected_status(leg) {
            return Err(ServiceError::StateConflict(format!(
                "{} cannot be verified while the order is {}",
                leg_label(leg),
                order.status
            )));
        }
        if !order.is_paid() {
            return Err(ServiceError::StateConflict(
                "Order has not been paid".to_string(),
            ));
        }
        if !order.codes_issued() {
            return Err(ServiceError::StateConflict(
                "Verification codes have not been issued yet".to_string(),
            ));
        }

        let state = OrderState::of(&order);
        let (outcome, changes) = if codes_match(order.stored_code(leg), &request.code) {
            let event = match leg {
                VerificationLeg::Handover => OrderEvent::HandoverVerified,
                VerificationLeg::Delivery => OrderEvent::DeliveryVerified,
            };
            let next = transition(state, event)?;
            let mut changes = state_changes(next);
            let now = Utc::now();
            match leg {
                VerificationLeg::Handover => {
                    changes.handover_verified_at = Set(Some(now));
                    if let Some(photo) = request.photo_url {
                        changes.handover_photo_url = Set(Some(photo));
                    }
                }
                VerificationLeg::Delivery => {
                    changes.delivery_verified_at = Set(Some(now));
                    if let Some(photo) = request.photo_url {
                        changes.delivery_photo_url = Set(Some(photo));
                    }
                }
            }
            (VerificationOutcome::Success { status: next.status }, changes)
        } else {
            let attempts = order.attempts(leg) + 1;
            let (outcome, mut changes) = if attempts >= max_attempts {
                let next = transition(state, OrderEvent::AttemptsExhausted(leg))?;
                (VerificationOutcome::Disputed, state_changes(next))
            } else {
                (
                    VerificationOutcome::Failure {
                        remaining_attempts: max_attempts - attempts,
                    },
                    no_changes(),
                )
            };
            match leg {
                VerificationLeg::Handover => changes.handover_attempts = Set(attempts),
                VerificationLeg::Delivery => changes.delivery_attempts = Set(attempts),
            }
            (outcome, changes)
        };

        let updated = commit_order_changes(&txn, &order, changes).await?;
        txn.commit().await?;

        match &outcome {
            VerificationOutcome::Success { status } => {
                counter!("maa.verification.success", 1, "leg" => leg.to_string());
                info!(status = %status, "Verification code accepted");
                publish(&self.event_sender, Event::LegVerified { order_id, leg }).await;
                publish(
                    &self.event_sender,
                    Event::OrderStatusChanged {
                        order_id,
                        old_status: order.status,
                        new_status: *status,
                    },
                )
                .await;
            }
            VerificationOutcome::Failure { remaining_attempts } => {
                counter!("maa.verification.failure", 1, "leg" => leg.to_string());
                warn!(remaining_attempts, "Incorrect verification code");
                publish(
                    &self.event_sender,
                    Event::VerificationFailed {
                        order_id,
                        leg,
                        remaining_attempts: *remaining_attempts,
                    },
                )
                .await;
            }
            VerificationOutcome::Disputed => {
                counter!("maa.verification.disputed", 1, "leg" => leg.to_string());
                warn!(
                    attempts = updated.attempts(leg),
                    remaining = remaining_attempts(&updated, leg, max_attempts),
                    "Verification attempts exhausted, order disputed"
                );
                publish(&self.event_sender, Event::OrderDisputed { order_id, leg }).await;
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        assert_eq!(
            VerificationOutcome::Failure {
                remaining_attempts: 1
            }
            .message(),
            "Incorrect code. 1 attempt remaining."
        );
        assert_eq!(
            VerificationOutcome::Failure {
                remaining_attempts: 3
            }
            .message(),
            "Incorrect code. 3 attempts remaining."
        );
        assert!(VerificationOutcome::Success {
            status: OrderStatus::Delivered
        }
        .message()
        .contains("complete"));
        assert!(VerificationOutcome::Disputed.message().contains("disputed"));
    }

    #[test]
    fn each_leg_expects_its_own_status() {
        assert_eq!(
            expected_status(VerificationLeg::Handover),
            OrderStatus::PendingHandover
        );
        assert_eq!(
            expected_status(VerificationLeg::Delivery),
            OrderStatus::InTransit
        );
    }
}
