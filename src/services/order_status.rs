//! Order lifecycle rules and the versioned write that applies them.

use chrono::Utc;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::{
    entities::order::{
        self, ActiveModel as OrderActiveModel, Entity as OrderEntity, Model as OrderModel,
        OrderStatus, PaymentStatus, VerificationLeg,
    },
    errors::ServiceError,
};

/// The pair of fields the state machine owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderState {
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
}

impl OrderState {
    pub fn new(status: OrderStatus, payment_status: PaymentStatus) -> Self {
        Self {
            status,
            payment_status,
        }
    }

    /// Where every purchase starts.
    pub fn initial() -> Self {
        Self::new(OrderStatus::PendingPayment, PaymentStatus::Pending)
    }

    pub fn of(order: &OrderModel) -> Self {
        Self::new(order.status, order.payment_status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    InstantPaymentSucceeded,
    InstantPaymentFailed,
    ManualPaymentSubmitted,
    ManualPaymentApproved,
    ManualPaymentRejected,
    HandoverVerified,
    DeliveryVerified,
    AttemptsExhausted(VerificationLeg),
    PaymentRefunded,
}

/// Applies `event` to `state`, or explains why it is not allowed.
pub fn transition(state: OrderState, event: OrderEvent) -> Result<OrderState, ServiceError> {
    use OrderEvent as E;
    use OrderStatus as S;
    use PaymentStatus as P;

    let next = match (state.status, state.payment_status, event) {
        // Payment, first attempt or retry after a failure
        (S::PendingPayment | S::PaymentFailed, P::Pending | P::Failed, E::InstantPaymentSucceeded) => {
            Some(OrderState::new(S::PendingHandover, P::Paid))
        }
        (S::PendingPayment | S::PaymentFailed, P::Pending | P::Failed, E::InstantPaymentFailed) => {
            Some(OrderState::new(S::PaymentFailed, P::Failed))
        }
        (
            S::PendingPayment | S::PaymentFailed,
            P::Pending | P::Failed | P::ManualReview,
            E::ManualPaymentSubmitted,
        ) => Some(OrderState::new(S::PendingPayment, P::ManualReview)),

        // Administrator settlement of a manual transfer
        (S::PendingPayment, P::ManualReview, E::ManualPaymentApproved) => {
            Some(OrderState::new(S::PendingHandover, P::Paid))
        }
        (S::PendingPayment, P::ManualReview, E::ManualPaymentRejected) => {
            Some(OrderState::new(S::PaymentFailed, P::Failed))
        }

        // Code challenges
        (S::PendingHandover, P::Paid, E::HandoverVerified) => {
            Some(OrderState::new(S::InTransit, P::Paid))
        }
        (S::InTransit, P::Paid, E::DeliveryVerified) => {
            Some(OrderState::new(S::Delivered, P::Paid))
        }
        (S::PendingHandover, P::Paid, E::AttemptsExhausted(VerificationLeg::Handover))
        | (S::InTransit, P::Paid, E::AttemptsExhausted(VerificationLeg::Delivery)) => {
            Some(OrderState::new(S::Disputed, P::Paid))
        }

        // Dispute resolution
        (S::Disputed, P::Paid, E::PaymentRefunded) => {
            Some(OrderState::new(S::Disputed, P::Refunded))
        }

        _ => None,
    };

    next.ok_or_else(|| ServiceError::StateConflict(conflict_message(state, event)))
}

fn conflict_message(state: OrderState, event: OrderEvent) -> String {
    use OrderEvent as E;

    match event {
        E::InstantPaymentSucceeded | E::InstantPaymentFailed | E::ManualPaymentSubmitted
            if state.payment_status == PaymentStatus::Paid =>
        {
            "Order has already been paid".to_string()
        }
        E::InstantPaymentSucceeded | E::InstantPaymentFailed
            if state.payment_status == PaymentStatus::ManualReview =>
        {
            "A manual payment for this order is awaiting review".to_string()
        }
        E::ManualPaymentApproved | E::ManualPaymentRejected => format!(
            "Order has no manual payment awaiting review (payment status is {})",
            state.payment_status
        ),
        _ => format!(
            "Cannot apply {:?} to an order that is {} with payment {}",
            event, state.status, state.payment_status
        ),
    }
}

/// Writes `changes` only if the row still carries `current.version`.
///
/// `changes` should hold only the columns being modified; the version bump and
/// `updated_at` are added here. Returns the row as stored after the write.
pub async fn commit_order_changes<C>(
    conn: &C,
    current: &OrderModel,
    mut changes: OrderActiveModel,
) -> Result<OrderModel, ServiceError>
where
    C: ConnectionTrait,
{
    changes.version = Set(current.version + 1);
    changes.updated_at = Set(Utc::now());

    let result = OrderEntity::update_many()
        .set(changes)
        .filter(order::Column::Id.eq(current.id))
        .filter(order::Column::Version.eq(current.version))
        .exec(conn)
        .await
        .map_err(|e| {
            error!(error = %e, order_id = %current.id, "Failed to update order");
            ServiceError::DatabaseError(e)
        })?;

    if result.rows_affected != 1 {
        warn!(order_id = %current.id, version = current.version, "Order version changed underneath update");
        return Err(ServiceError::ConcurrentModification(current.id));
    }

    load_order(conn, current.id).await
}

pub(crate) async fn load_order<C>(conn: &C, order_id: Uuid) -> Result<OrderModel, ServiceError>
where
    C: ConnectionTrait,
{
    OrderEntity::find_by_id(order_id)
        .one(conn)
        .await
        .map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to fetch order");
            ServiceError::DatabaseError(e)
        })?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

/// An active model with nothing marked as changed.
pub(crate) fn no_changes() -> OrderActiveModel {
    OrderActiveModel {
        ..Default::default()
    }
}

/// Starts a change set that moves the order to `next`.
pub(crate) fn state_changes(next: OrderState) -> OrderActiveModel {
    let mut changes = no_changes();
    changes.status = Set(next.status);
    changes.payment_status = Set(next.payment_status);
    changes
}
