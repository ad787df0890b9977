#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, DatabaseBackend, EntityTrait, Set, Statement,
};
use std::sync::Arc;
use uuid::Uuid;

use storefront_core::{
    config::AppConfig,
    db,
    entities::{discount_code, product},
    errors::ServiceError,
    events,
    services::payments::{PaymentGateway, PaymentIntent},
    AppState,
};

/// Test harness backed by a throwaway SQLite database, one per test.
pub struct TestApp {
    pub state: AppState,
    db_path: std::path::PathBuf,
    _event_task: tokio::task::JoinHandle<()>,
}

/// Gateway fake: returns canned intents and never talks to the network.
pub struct FakeGateway;

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_intent(
        &self,
        amount: Decimal,
        currency: &str,
        order_id: Uuid,
        _user_id: Uuid,
    ) -> Result<PaymentIntent, ServiceError> {
        Ok(PaymentIntent {
            id: format!("pi_test_{}", order_id.simple()),
            client_secret: Some("cs_test".to_string()),
            status: "requires_payment_method".to_string(),
            amount,
            currency: currency.to_string(),
        })
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, ServiceError> {
        Ok(PaymentIntent {
            id: intent_id.to_string(),
            client_secret: None,
            status: "succeeded".to_string(),
            amount: Decimal::ZERO,
            currency: "eur".to_string(),
        })
    }

    async fn cancel_intent(&self, intent_id: &str) -> Result<PaymentIntent, ServiceError> {
        Ok(PaymentIntent {
            id: intent_id.to_string(),
            client_secret: None,
            status: "canceled".to_string(),
            amount: Decimal::ZERO,
            currency: "eur".to_string(),
        })
    }

    async fn refund(
        &self,
        _intent_id: &str,
        _amount: Option<Decimal>,
    ) -> Result<(), ServiceError> {
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE carts (
        id TEXT PRIMARY KEY NOT NULL,
        user_id TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE cart_items (
        id TEXT PRIMARY KEY NOT NULL,
        cart_id TEXT NOT NULL,
        product_id TEXT NOT NULL,
        quantity INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (cart_id, product_id)
    );"#,
    r#"CREATE TABLE products (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        price REAL NOT NULL,
        stock_quantity INTEGER NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE discount_codes (
        id TEXT PRIMARY KEY NOT NULL,
        code TEXT NOT NULL UNIQUE,
        discount_type TEXT NOT NULL,
        value REAL NOT NULL,
        min_purchase REAL,
        max_discount REAL,
        usage_limit INTEGER,
        used_count INTEGER NOT NULL,
        is_active INTEGER NOT NULL,
        valid_from TEXT NOT NULL,
        valid_until TEXT NOT NULL,
        created_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE orders (
        id TEXT PRIMARY KEY NOT NULL,
        order_number TEXT NOT NULL UNIQUE,
        user_id TEXT NOT NULL,
        status TEXT NOT NULL,
        payment_status TEXT NOT NULL,
        subtotal REAL NOT NULL,
        tax REAL NOT NULL,
        shipping REAL NOT NULL,
        discount REAL NOT NULL,
        total REAL NOT NULL,
        currency TEXT NOT NULL,
        shipping_address TEXT NOT NULL,
        billing_address TEXT NOT NULL,
        discount_code_id TEXT,
        payment_intent_id TEXT,
        failure_reason TEXT,
        refunded_amount REAL,
        customer_note TEXT,
        cancelled_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        version INTEGER NOT NULL
    );"#,
    r#"CREATE TABLE order_items (
        id TEXT PRIMARY KEY NOT NULL,
        order_id TEXT NOT NULL,
        product_id TEXT NOT NULL,
        product_name TEXT NOT NULL,
        quantity INTEGER NOT NULL,
        unit_price REAL NOT NULL,
        line_total REAL NOT NULL,
        created_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE webhook_events (
        event_id TEXT PRIMARY KEY NOT NULL,
        event_type TEXT NOT NULL,
        order_id TEXT,
        processed_at TEXT NOT NULL
    );"#,
];

impl TestApp {
    /// Constructs application state over a fresh database.
    pub async fn new() -> Self {
        let db_path =
            std::env::temp_dir().join(format!("storefront_test_{}.db", Uuid::new_v4().simple()));
        let _ = std::fs::remove_file(&db_path);

        let mut config = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "test",
        );
        config.payment_webhook_secret = Some("whsec_test_secret".to_string());
        config.db_max_connections = 1;
        config.db_min_connections = 1;

        let pool = db::connect(&config)
            .await
            .expect("failed to create test database");

        for sql in SCHEMA {
            pool.execute(Statement::from_string(
                DatabaseBackend::Sqlite,
                sql.to_string(),
            ))
            .await
            .expect("failed to create test schema");
        }

        // Drain events so senders never block on a full buffer.
        let (event_sender, mut receiver) = events::channel(64);
        let event_task = tokio::spawn(async move { while receiver.recv().await.is_some() {} });

        let state = AppState::new(
            Arc::new(pool),
            Arc::new(config),
            Arc::new(event_sender),
            Arc::new(FakeGateway),
        );

        Self {
            state,
            db_path,
            _event_task: event_task,
        }
    }

    /// Inserts a product and returns its id.
    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        product::ActiveModel {
            id: Set(id),
            name: Set(name.to_string()),
            price: Set(price),
            stock_quantity: Set(stock),
            status: Set(if stock > 0 {
                product::ProductStatus::Active
            } else {
                product::ProductStatus::OutOfStock
            }),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to seed product");
        id
    }

    /// Inserts a discount code valid for the next 30 days.
    pub async fn seed_discount(
        &self,
        code: &str,
        discount_type: discount_code::DiscountType,
        value: Decimal,
        min_purchase: Option<Decimal>,
        max_discount: Option<Decimal>,
        usage_limit: Option<i32>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        discount_code::ActiveModel {
            id: Set(id),
            code: Set(code.to_uppercase()),
            discount_type: Set(discount_type),
            value: Set(value),
            min_purchase: Set(min_purchase),
            max_discount: Set(max_discount),
            usage_limit: Set(usage_limit),
            used_count: Set(0),
            is_active: Set(true),
            valid_from: Set(now - Duration::days(1)),
            valid_until: Set(now + Duration::days(30)),
            created_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to seed discount");
        id
    }

    pub async fn fetch_product(&self, id: Uuid) -> product::Model {
        product::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("failed to fetch product")
            .expect("product missing")
    }

    pub async fn fetch_discount(&self, id: Uuid) -> discount_code::Model {
        discount_code::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("failed to fetch discount")
            .expect("discount missing")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.db_path);
    }
}
