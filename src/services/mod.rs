use std::sync::Arc;

use crate::{config::AppConfig, db::DbPool, events::EventSender};

// Order core
pub mod codes;
pub mod contact_policy;
pub mod order_status;
pub mod orders;
pub mod payments;
pub mod verification;

// Collaborators
pub mod listings;
pub mod users;

/// Every service, built once and shared.
#[derive(Clone)]
pub struct AppServices {
    pub users: Arc<users::UserService>,
    pub listings: Arc<listings::ListingService>,
    pub orders: Arc<orders::OrderService>,
    pub payments: Arc<payments::PaymentService>,
    pub verification: Arc<verification::VerificationService>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        config: &AppConfig,
        gateways: payments::PaymentGateways,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        let adapter = Arc::new(payments::PaymentGatewayAdapter::new(gateways));

        Self {
            users: Arc::new(users::UserService::new(
                db_pool.clone(),
                event_sender.clone(),
            )),
            listings: Arc::new(listings::ListingService::new(
                db_pool.clone(),
                event_sender.clone(),
            )),
            orders: Arc::new(orders::OrderService::new(
                db_pool.clone(),
                event_sender.clone(),
                config.verification.clone(),
            )),
            payments: Arc::new(payments::PaymentService::new(
                db_pool.clone(),
                event_sender.clone(),
                adapter,
                payments::PaymentSettings::from(config),
            )),
            verification: Arc::new(verification::VerificationService::new(
                db_pool,
                event_sender,
                config.verification.clone(),
            )),
        }
    }
}
