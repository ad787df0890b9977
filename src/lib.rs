//! storefront-core
//!
//! Order creation and payment reconciliation core for a storefront backend.
//! The crate converts a mutable shopping cart into an immutable, priced,
//! stock-committed order inside one atomic transaction, and later reconciles
//! order state against asynchronous, possibly-duplicated payment gateway
//! events. Transport (HTTP routing, auth) is owned by the embedding
//! application; everything here is exposed as typed service calls.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod logging;
pub mod services;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::services::{
    CartService, DiscountService, OrderService, PaymentGateway, PaymentService, WebhookReconciler,
};

/// Shared application state: the database pool, configuration, event bus and
/// the wired-up services. Dependencies are passed in explicitly so tests can
/// substitute fakes (notably the payment gateway) without global state.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: Arc<events::EventSender>,
    pub cart_service: CartService,
    pub discount_service: DiscountService,
    pub order_service: OrderService,
    pub payment_service: PaymentService,
    pub webhook_reconciler: WebhookReconciler,
}

impl AppState {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<config::AppConfig>,
        event_sender: Arc<events::EventSender>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            cart_service: CartService::new(db.clone(), event_sender.clone()),
            discount_service: DiscountService::new(db.clone()),
            order_service: OrderService::new(db.clone(), event_sender.clone(), config.clone()),
            payment_service: PaymentService::new(db.clone(), gateway),
            webhook_reconciler: WebhookReconciler::new(
                db.clone(),
                event_sender.clone(),
                config.clone(),
            ),
            db,
            config,
            event_sender,
        }
    }
}
