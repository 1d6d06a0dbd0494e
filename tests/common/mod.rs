#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use mockall::mock;
use rust_decimal::Decimal;
use uuid::Uuid;

use maa_express::{
    auth::Actor,
    config::AppConfig,
    db::{self, DbPool},
    entities::{listing::Model as ListingModel, order::Model as OrderModel},
    gateways::{
        GatewayError, GatewayPaymentStatus, GatewayProvider, GatewayReference, IntentRequest,
        PaymentGateway, PaymentIntent, RefundRequest,
    },
    services::{
        listings::{CreateListingRequest, ListingDecision},
        orders::PurchaseRequest,
        payments::PaymentGateways,
        users::CreateProfileRequest,
        AppServices,
    },
};

mock! {
    pub Gateway {}

    #[async_trait]
    impl PaymentGateway for Gateway {
        fn provider(&self) -> GatewayProvider;
        async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayError>;
        async fn verify_payment(
            &self,
            reference: &GatewayReference,
        ) -> Result<GatewayPaymentStatus, GatewayError>;
        async fn refund(&self, request: &RefundRequest) -> Result<String, GatewayError>;
    }
}

/// Services over a private in-memory SQLite database.
pub struct TestHarness {
    pub db: Arc<DbPool>,
    pub config: AppConfig,
    pub services: AppServices,
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());
    // A single connection keeps every query on the same in-memory database.
    cfg.db_max_connections = 1;
    cfg.db_min_connections = 1;
    cfg
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with(test_config(), PaymentGateways::new()).await
    }

    pub async fn with_gateways(gateways: PaymentGateways) -> Self {
        Self::with(test_config(), gateways).await
    }

    pub async fn with(config: AppConfig, gateways: PaymentGateways) -> Self {
        let pool = db::establish_connection_from_app_config(&config)
            .await
            .expect("failed to open test database");
        db::create_schema(&pool)
            .await
            .expect("failed to create schema");
        let db = Arc::new(pool);
        let services = AppServices::new(db.clone(), &config, gateways, None);
        Self {
            db,
            config,
            services,
        }
    }

    pub async fn user(&self, phone_verified: bool) -> Actor {
        let id = Uuid::new_v4();
        self.services
            .users
            .create_profile(CreateProfileRequest {
                id,
                email: format!("user-{}@example.com", id.simple()),
                full_name: Some("Test User".to_string()),
                phone: Some("+61400000000".to_string()),
                phone_verified,
                is_admin: false,
            })
            .await
            .expect("failed to create user");
        Actor::user(id)
    }

    pub async fn seller(&self) -> Actor {
        self.user(true).await
    }

    pub async fn buyer(&self) -> Actor {
        self.user(false).await
    }

    pub async fn admin(&self) -> Actor {
        let id = Uuid::new_v4();
        self.services
            .users
            .create_profile(CreateProfileRequest {
                id,
                email: format!("admin-{}@example.com", id.simple()),
                full_name: Some("Moderator".to_string()),
                phone: None,
                phone_verified: false,
                is_admin: true,
            })
            .await
            .expect("failed to create admin");
        Actor::admin(id)
    }

    /// A pending listing from `seller`.
    pub async fn listing(
        &self,
        seller: &Actor,
        price_per_kg: Decimal,
        total_weight: Decimal,
    ) -> ListingModel {
        self.services
            .listings
            .create_listing(seller, listing_request(price_per_kg, total_weight))
            .await
            .expect("failed to create listing")
    }

    /// A listing already through moderation.
    pub async fn approved_listing(
        &self,
        seller: &Actor,
        price_per_kg: Decimal,
        total_weight: Decimal,
    ) -> ListingModel {
        let listing = self.listing(seller, price_per_kg, total_weight).await;
        let admin = self.admin().await;
        self.services
            .listings
            .moderate_listing(&admin, listing.id, ListingDecision::Approve)
            .await
            .expect("failed to approve listing")
    }

    pub async fn purchase(
        &self,
        buyer: &Actor,
        listing_id: Uuid,
        weight: Decimal,
        with_documents: bool,
    ) -> OrderModel {
        let mut request = purchase_request(listing_id, weight);
        if with_documents {
            request.sender_id_url = Some("uploads/sender-id.jpg".to_string());
        }
        self.services
            .orders
            .purchase(buyer, request)
            .await
            .expect("failed to purchase")
    }

    pub async fn remaining_weight(&self, listing_id: Uuid) -> Decimal {
        self.services
            .listings
            .get_listing(listing_id)
            .await
            .expect("listing")
            .remaining_weight
    }
}

pub fn listing_request(price_per_kg: Decimal, total_weight: Decimal) -> CreateListingRequest {
    CreateListingRequest {
        title: "Sydney to Dhaka, spare luggage".to_string(),
        origin: "Sydney".to_string(),
        origin_airport: Some("SYD".to_string()),
        destination: "Dhaka".to_string(),
        destination_airport: Some("DAC".to_string()),
        travel_date: (Utc::now() + Duration::days(30)).date_naive(),
        currency: "AUD".to_string(),
        price_per_kg,
        total_weight,
        discount_percent: Decimal::ZERO,
        origin_phone: Some("+61411111111".to_string()),
        destination_phone: Some("+8801711111111".to_string()),
        passport_photo_url: None,
        ticket_copy_url: None,
        pickup_note: Some("Meet at the departures hall".to_string()),
    }
}

pub fn purchase_request(listing_id: Uuid, weight: Decimal) -> PurchaseRequest {
    PurchaseRequest {
        listing_id,
        weight,
        receiver_name: "Rahim Uddin".to_string(),
        receiver_phone: "+8801722222222".to_string(),
        receiver_email: Some("receiver@example.com".to_string()),
        delivery_address: "House 12, Road 5, Dhanmondi".to_string(),
        delivery_postcode: Some("1205".to_string()),
        delivery_country: "Bangladesh".to_string(),
        sender_id_url: None,
        luggage_photo_url: None,
    }
}

/// A gateway that opens `intent_id` and reports it settled for `amount_minor`.
pub fn settling_gateway(intent_id: &str, amount_minor: i64) -> MockGateway {
    let mut gateway = MockGateway::new();
    gateway.expect_provider().return_const(GatewayProvider::Stripe);
    let created = intent_id.to_string();
    gateway.expect_create_intent().returning(move |_| {
        Ok(PaymentIntent {
            provider: GatewayProvider::Stripe,
            intent_id: created.clone(),
            client_secret: Some(format!("{}_secret", created)),
            approval_url: None,
        })
    });
    let settled = intent_id.to_string();
    gateway.expect_verify_payment().returning(move |_| {
        Ok(GatewayPaymentStatus::Succeeded {
            transaction_id: settled.clone(),
            amount_minor: Some(amount_minor),
        })
    });
    gateway
}
