use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    entities::discount_code::{self, DiscountType, Entity as DiscountCodeEntity},
    errors::{DiscountError, ServiceError},
};

/// A discount that passed validation against a candidate subtotal.
/// Carries only the frozen data the pricing engine needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedDiscount {
    pub id: Uuid,
    pub code: String,
    pub discount_type: DiscountType,
    pub value: Decimal,
    pub max_discount: Option<Decimal>,
}

impl ValidatedDiscount {
    /// Computes the discount amount for a subtotal. Percentage discounts are
    /// capped by `max_discount`; fixed amounts clamp to the subtotal. The
    /// result is never negative and never exceeds the subtotal.
    pub fn amount(&self, subtotal: Decimal) -> Decimal {
        let raw = match self.discount_type {
            DiscountType::Percentage => {
                let mut amount = subtotal * self.value / Decimal::from(100);
                if let Some(cap) = self.max_discount {
                    amount = amount.min(cap);
                }
                amount
            }
            DiscountType::FixedAmount => self.value,
        };
        raw.clamp(Decimal::ZERO, subtotal)
    }
}

/// Validates a discount code against a candidate subtotal.
///
/// Checks run in a fixed order so the caller gets the most specific error:
/// existence, active flag, validity window, usage count, minimum purchase.
/// Runs on any connection so the order coordinator can re-validate inside
/// its transaction.
pub async fn validate_on<C: ConnectionTrait>(
    conn: &C,
    code: &str,
    subtotal: Decimal,
) -> Result<ValidatedDiscount, ServiceError> {
    let normalized = code.trim().to_uppercase();

    let discount = DiscountCodeEntity::find()
        .filter(discount_code::Column::Code.eq(normalized))
        .one(conn)
        .await?
        .ok_or(DiscountError::CodeNotFound)?;

    if !discount.is_active {
        return Err(DiscountError::CodeInactive.into());
    }

    let now = Utc::now();
    if now < discount.valid_from {
        return Err(DiscountError::CodeNotYetValid.into());
    }
    if now > discount.valid_until {
        return Err(DiscountError::CodeExpired.into());
    }

    if let Some(limit) = discount.usage_limit {
        if discount.used_count >= limit {
            return Err(DiscountError::UsageLimitReached.into());
        }
    }

    if let Some(minimum) = discount.min_purchase {
        if subtotal < minimum {
            return Err(DiscountError::MinimumPurchaseNotMet { minimum }.into());
        }
    }

    Ok(ValidatedDiscount {
        id: discount.id,
        code: discount.code,
        discount_type: discount.discount_type,
        value: discount.value,
        max_discount: discount.max_discount,
    })
}

/// Increments a code's `used_count`, guarded so the usage limit holds under
/// concurrent order creation. Fails fresh when another transaction took the
/// last use between validation and commit.
pub async fn consume_on<C: ConnectionTrait>(
    conn: &C,
    discount_id: Uuid,
) -> Result<(), ServiceError> {
    let result = DiscountCodeEntity::update_many()
        .col_expr(
            discount_code::Column::UsedCount,
            Expr::col(discount_code::Column::UsedCount).add(1),
        )
        .filter(discount_code::Column::Id.eq(discount_id))
        .filter(
            Condition::any()
                .add(discount_code::Column::UsageLimit.is_null())
                .add(
                    Expr::col(discount_code::Column::UsedCount)
                        .lt(Expr::col(discount_code::Column::UsageLimit)),
                ),
        )
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(DiscountError::UsageLimitReached.into());
    }
    Ok(())
}

/// Read-only discount validation for callers outside the order transaction
/// (e.g. a "check this code" endpoint in the excluded HTTP layer).
#[derive(Clone)]
pub struct DiscountService {
    db: Arc<DatabaseConnection>,
}

impl DiscountService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn validate(
        &self,
        code: &str,
        subtotal: Decimal,
    ) -> Result<ValidatedDiscount, ServiceError> {
        validate_on(&*self.db, code, subtotal).await
    }
}
