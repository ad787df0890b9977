use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::Serialize;
use uuid::Uuid;

use crate::entities::order::OrderStatus;

/// Discount validation outcome. Checks run in a fixed order so the caller
/// always sees the most specific failure: existence, active flag, time
/// window, usage count, minimum purchase.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
pub enum DiscountError {
    #[error("Discount code not found")]
    CodeNotFound,

    #[error("Discount code is inactive")]
    CodeInactive,

    #[error("Discount code is not valid yet")]
    CodeNotYetValid,

    #[error("Discount code has expired")]
    CodeExpired,

    #[error("Discount code usage limit reached")]
    UsageLimitReached,

    #[error("Minimum purchase of {minimum} not met")]
    MinimumPurchaseNotMet { minimum: Decimal },
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Cart is empty")]
    EmptyCart,

    #[error("Product \"{name}\" is not available")]
    ProductUnavailable { product_id: Uuid, name: String },

    #[error("Insufficient stock for \"{name}\": only {available} available")]
    InsufficientStock {
        product_id: Uuid,
        name: String,
        available: i32,
    },

    #[error("Invalid order status transition from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error(transparent)]
    Discount(#[from] DiscountError),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payment gateway error: {0}")]
    PaymentGateway(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// True when the underlying database error is a unique-key violation.
    /// Used for the single internal retry on an order-number collision and
    /// for the webhook idempotency short-circuit.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            ServiceError::DatabaseError(err) => is_unique_violation(err),
            _ => false,
        }
    }
}

pub(crate) fn is_unique_violation(err: &DbErr) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("unique") || msg.contains("duplicate key")
}
