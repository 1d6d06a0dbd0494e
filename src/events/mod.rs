use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::{
    listing::ListingStatus,
    order::{OrderStatus, PaymentMethod, VerificationLeg},
};
use crate::gateways::GatewayProvider;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Sends `event` if a sender is configured; failures are logged, never returned.
pub(crate) async fn publish(sender: &Option<std::sync::Arc<EventSender>>, event: Event) {
    if let Some(sender) = sender {
        if let Err(e) = sender.send(event).await {
            warn!(error = %e, "Failed to publish domain event");
        }
    }
}

// Define the various events that can occur in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Order events
    OrderCreated {
        order_id: Uuid,
        listing_id: Uuid,
        buyer_id: Uuid,
        weight: Decimal,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    DocumentsUploaded(Uuid),
    VerificationCodesIssued(Uuid),

    // Payment events
    PaymentIntentCreated {
        order_id: Uuid,
        provider: GatewayProvider,
    },
    ManualPaymentSubmitted {
        order_id: Uuid,
        method: PaymentMethod,
    },
    PaymentCaptured {
        order_id: Uuid,
        transaction_id: String,
    },
    PaymentApproved(Uuid),
    PaymentRejected {
        order_id: Uuid,
        reason: String,
    },
    PaymentFailed(Uuid),
    PaymentRefunded(Uuid),

    // Verification events
    LegVerified {
        order_id: Uuid,
        leg: VerificationLeg,
    },
    VerificationFailed {
        order_id: Uuid,
        leg: VerificationLeg,
        remaining_attempts: i32,
    },
    OrderDisputed {
        order_id: Uuid,
        leg: VerificationLeg,
    },

    // Listing events
    ListingCreated(Uuid),
    ListingUpdated(Uuid),
    ListingModerated {
        listing_id: Uuid,
        status: ListingStatus,
    },
    ListingDeleted(Uuid),

    // Account events
    PayoutDetailsUpdated(Uuid),
    UserAccessChanged {
        user_id: Uuid,
        is_active: bool,
        is_admin: bool,
    },
}

/// Drains the event channel, logging each event.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderDisputed { order_id, leg } => {
                warn!(order_id = %order_id, leg = %leg, "Order disputed after exhausting verification attempts");
            }
            Event::PaymentRejected { order_id, reason } => {
                info!(order_id = %order_id, reason = %reason, "Manual payment rejected");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(order_id = %order_id, from = %old_status, to = %new_status, "Order status changed");
            }
            other => {
                info!(event = ?other, "Received event");
            }
        }
    }

    info!("Event processing loop stopped");
}
