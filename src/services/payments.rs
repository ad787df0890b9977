//! Payment gateway capability and webhook signature verification.
//!
//! The gateway is consumed behind [`PaymentGateway`] so the order core never
//! depends on a concrete processor; tests substitute a fake without any
//! process-wide state. [`StripeGateway`] is the production implementation.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    entities::order::{self, Entity as OrderEntity, PaymentStatus},
    errors::ServiceError,
};

type HmacSha256 = Hmac<Sha256>;

/// A payment intent as reported by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: Option<String>,
    pub status: String,
    pub amount: Decimal,
    pub currency: String,
}

/// Remote payment processor capability. Calls are fallible remote calls;
/// the core surfaces transient errors to the caller and never retries
/// automatically.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(
        &self,
        amount: Decimal,
        currency: &str,
        order_id: Uuid,
        user_id: Uuid,
    ) -> Result<PaymentIntent, ServiceError>;

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, ServiceError>;

    async fn cancel_intent(&self, intent_id: &str) -> Result<PaymentIntent, ServiceError>;

    async fn refund(
        &self,
        intent_id: &str,
        amount: Option<Decimal>,
    ) -> Result<(), ServiceError>;
}

/// Stripe-shaped gateway implementation over HTTPS.
pub struct StripeGateway {
    client: reqwest::Client,
    secret_key: String,
    base_url: String,
}

impl StripeGateway {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret_key: secret_key.into(),
            base_url: "https://api.stripe.com/v1".to_string(),
        }
    }

    /// Overrides the API endpoint (used against a local gateway stub).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn post_form(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<IntentWire, ServiceError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.secret_key)
            .form(params)
            .send()
            .await
            .map_err(|e| ServiceError::PaymentGateway(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::PaymentGateway(format!(
                "gateway returned {}: {}",
                status, body
            )));
        }

        response
            .json::<IntentWire>()
            .await
            .map_err(|e| ServiceError::PaymentGateway(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct IntentWire {
    id: String,
    #[serde(default)]
    client_secret: Option<String>,
    status: String,
    amount: i64,
    currency: String,
}

impl From<IntentWire> for PaymentIntent {
    fn from(wire: IntentWire) -> Self {
        PaymentIntent {
            id: wire.id,
            client_secret: wire.client_secret,
            status: wire.status,
            amount: Decimal::new(wire.amount, 2),
            currency: wire.currency,
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_intent(
        &self,
        amount: Decimal,
        currency: &str,
        order_id: Uuid,
        user_id: Uuid,
    ) -> Result<PaymentIntent, ServiceError> {
        let params = vec![
            ("amount".to_string(), minor_units(amount)?.to_string()),
            ("currency".to_string(), currency.to_lowercase()),
            ("metadata[order_id]".to_string(), order_id.to_string()),
            ("metadata[user_id]".to_string(), user_id.to_string()),
        ];
        let wire = self.post_form("/payment_intents", &params).await?;
        Ok(wire.into())
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, ServiceError> {
        let response = self
            .client
            .get(format!("{}/payment_intents/{}", self.base_url, intent_id))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| ServiceError::PaymentGateway(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ServiceError::PaymentGateway(format!(
                "gateway returned {}",
                response.status()
            )));
        }

        let wire: IntentWire = response
            .json()
            .await
            .map_err(|e| ServiceError::PaymentGateway(e.to_string()))?;
        Ok(wire.into())
    }

    async fn cancel_intent(&self, intent_id: &str) -> Result<PaymentIntent, ServiceError> {
        let wire = self
            .post_form(&format!("/payment_intents/{}/cancel", intent_id), &[])
            .await?;
        Ok(wire.into())
    }

    async fn refund(
        &self,
        intent_id: &str,
        amount: Option<Decimal>,
    ) -> Result<(), ServiceError> {
        let mut params = vec![("payment_intent".to_string(), intent_id.to_string())];
        if let Some(amount) = amount {
            params.push(("amount".to_string(), minor_units(amount)?.to_string()));
        }

        let response = self
            .client
            .post(format!("{}/refunds", self.base_url))
            .bearer_auth(&self.secret_key)
            .form(&params)
            .send()
            .await
            .map_err(|e| ServiceError::PaymentGateway(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ServiceError::PaymentGateway(format!(
                "gateway returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    (amount * Decimal::from(100))
        .round()
        .to_i64()
        .ok_or_else(|| ServiceError::PaymentGateway(format!("amount {} out of range", amount)))
}

/// Service that attaches payment intents to orders.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
}

impl PaymentService {
    pub fn new(db: Arc<DatabaseConnection>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { db, gateway }
    }

    /// Creates a gateway payment intent for an order's total and records the
    /// intent id on the order. Only meaningful while payment is pending.
    #[instrument(skip(self))]
    pub async fn create_intent_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<PaymentIntent, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.payment_status != PaymentStatus::Pending {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} payment is already {}",
                order_id, order.payment_status
            )));
        }

        let intent = self
            .gateway
            .create_intent(order.total, &order.currency, order.id, order.user_id)
            .await?;

        let mut active: order::ActiveModel = order.into();
        active.payment_intent_id = Set(Some(intent.id.clone()));
        active.updated_at = Set(chrono::Utc::now());
        active.update(&*self.db).await?;

        info!(%order_id, intent_id = %intent.id, "Payment intent created");
        Ok(intent)
    }
}

/// Gateway webhook event kinds the reconciler understands. Anything else is
/// carried as `Unknown` and ignored downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayEventKind {
    PaymentSucceeded,
    PaymentFailed,
    PaymentCanceled,
    ChargeRefunded,
    Unknown(String),
}

/// A verified, parsed gateway event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    pub kind: GatewayEventKind,
    pub payment_intent_id: Option<String>,
    pub order_id: Option<Uuid>,
    pub amount_refunded: Option<Decimal>,
    pub failure_reason: Option<String>,
}

/// Verifies a gateway webhook signature and parses the payload.
///
/// The signature header carries `t=<unix seconds>,v1=<hex hmac>`; the HMAC
/// is SHA-256 over `"{t}.{raw body}"` with the shared webhook secret.
/// Timestamps older than `tolerance_secs` are rejected to stop replays.
pub fn verify_webhook_signature(
    raw_body: &[u8],
    signature_header: &str,
    secret: &str,
    tolerance_secs: u64,
) -> Result<GatewayEvent, ServiceError> {
    let mut timestamp = "";
    let mut signature = "";
    for part in signature_header.split(',') {
        let mut it = part.trim().splitn(2, '=');
        match (it.next(), it.next()) {
            (Some("t"), Some(value)) => timestamp = value,
            (Some("v1"), Some(value)) => signature = value,
            _ => {}
        }
    }

    if timestamp.is_empty() || signature.is_empty() {
        return Err(ServiceError::InvalidSignature);
    }

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| ServiceError::InvalidSignature)?;
    let now = chrono::Utc::now().timestamp();
    if (now - ts).unsigned_abs() > tolerance_secs {
        return Err(ServiceError::InvalidSignature);
    }

    let provided = hex::decode(signature).map_err(|_| ServiceError::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ServiceError::InvalidSignature)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    // Mac::verify_slice compares in constant time.
    mac.verify_slice(&provided)
        .map_err(|_| ServiceError::InvalidSignature)?;

    parse_event(raw_body)
}

/// Parses a verified webhook payload into a typed event.
pub fn parse_event(raw_body: &[u8]) -> Result<GatewayEvent, ServiceError> {
    let payload: serde_json::Value = serde_json::from_slice(raw_body)
        .map_err(|e| ServiceError::ValidationError(format!("invalid webhook json: {}", e)))?;

    let id = payload
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ServiceError::ValidationError("webhook event has no id".to_string()))?
        .to_string();

    let event_type = payload.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let object = payload
        .pointer("/data/object")
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    let kind = match event_type {
        "payment_intent.succeeded" => GatewayEventKind::PaymentSucceeded,
        "payment_intent.payment_failed" => GatewayEventKind::PaymentFailed,
        "payment_intent.canceled" => GatewayEventKind::PaymentCanceled,
        "charge.refunded" => GatewayEventKind::ChargeRefunded,
        other => GatewayEventKind::Unknown(other.to_string()),
    };

    // For intent events the object id is the intent; a charge carries its
    // intent in `payment_intent` instead.
    let payment_intent_id = match kind {
        GatewayEventKind::ChargeRefunded => object
            .get("payment_intent")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => object.get("id").and_then(|v| v.as_str()).map(str::to_string),
    };

    let order_id = object
        .pointer("/metadata/order_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok());

    let amount_refunded = object
        .get("amount_refunded")
        .and_then(|v| v.as_i64())
        .map(|cents| Decimal::new(cents, 2));

    let failure_reason = object
        .pointer("/last_payment_error/message")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Ok(GatewayEvent {
        id,
        kind,
        payment_intent_id,
        order_id,
        amount_refunded,
        failure_reason,
    })
}
