//! MAA Express marketplace core
//!
//! Order lifecycle for a peer-to-peer luggage-capacity marketplace: purchase,
//! payment capture, handover and delivery code checks, and the contact rules
//! that depend on payment state.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateways;
pub mod services;

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::{
    config::AppConfig,
    db::DbPool,
    errors::ServiceError,
    events::EventSender,
    services::{payments::PaymentGateways, AppServices},
};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: AppConfig,
    pub event_sender: Arc<EventSender>,
    pub services: AppServices,
}

impl AppState {
    /// Connects to the database, ensures the schema, builds the payment gateways
    /// from config, and starts the event logging loop.
    pub async fn initialize(config: AppConfig) -> Result<Self, ServiceError> {
        let db = Arc::new(db::establish_connection_from_app_config(&config).await?);
        db::create_schema(&*db).await?;

        let (tx, rx) = mpsc::channel(config.event_channel_capacity);
        let event_sender = Arc::new(EventSender::new(tx));
        tokio::spawn(events::process_events(rx));

        let gateways = PaymentGateways::from_config(&config.payments)?;
        let services = AppServices::new(
            db.clone(),
            &config,
            gateways,
            Some(event_sender.clone()),
        );

        info!(environment = %config.environment, "Application state initialized");
        Ok(Self {
            db,
            config,
            event_sender,
            services,
        })
    }
}
