//! Inventory ledger: atomic stock reservation and release.
//!
//! Both operations are generic over [`ConnectionTrait`] so they run inside
//! the caller's transaction; a stock decrement can never be observed without
//! the order write that justified it. The check-then-decrement race window
//! is closed by a conditional UPDATE, not by an application-level read.

use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use tracing::debug;
use uuid::Uuid;

use crate::{
    entities::product::{self, Entity as ProductEntity, ProductStatus},
    errors::ServiceError,
};

/// Reserves `quantity` units of a product by decrementing its stock.
///
/// Fails with [`ServiceError::ProductUnavailable`] when the product is
/// inactive or flagged out of stock (even if a stale quantity remains), and
/// with [`ServiceError::InsufficientStock`] when fewer units are on hand
/// than requested. On success the product status flips to `OutOfStock`
/// when the remaining quantity reaches zero.
pub async fn reserve<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    quantity: i32,
) -> Result<(), ServiceError> {
    let product = ProductEntity::find_by_id(product_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

    if product.status != ProductStatus::Active {
        return Err(ServiceError::ProductUnavailable {
            product_id,
            name: product.name,
        });
    }

    // Guarded decrement: whoever commits first wins the last unit, the
    // loser sees a fresh zero-row update rather than a stale read.
    let result = ProductEntity::update_many()
        .col_expr(
            product::Column::StockQuantity,
            Expr::col(product::Column::StockQuantity).sub(quantity),
        )
        .filter(product::Column::Id.eq(product_id))
        .filter(product::Column::Status.eq(ProductStatus::Active))
        .filter(product::Column::StockQuantity.gte(quantity))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        let available = ProductEntity::find_by_id(product_id)
            .one(conn)
            .await?
            .map(|p| p.stock_quantity)
            .unwrap_or(0);
        return Err(ServiceError::InsufficientStock {
            product_id,
            name: product.name,
            available,
        });
    }

    // Maintain stock_quantity == 0 <=> status == OutOfStock.
    ProductEntity::update_many()
        .set(product::ActiveModel {
            status: Set(ProductStatus::OutOfStock),
            ..Default::default()
        })
        .filter(product::Column::Id.eq(product_id))
        .filter(product::Column::Status.eq(ProductStatus::Active))
        .filter(product::Column::StockQuantity.lte(0))
        .exec(conn)
        .await?;

    debug!(%product_id, quantity, "Reserved stock");
    Ok(())
}

/// Releases `quantity` units back to stock. A compensating action, so it is
/// unconditional: it never fails for business reasons and re-activates a
/// product that was auto-flagged out of stock.
pub async fn release<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    quantity: i32,
) -> Result<(), ServiceError> {
    ProductEntity::update_many()
        .col_expr(
            product::Column::StockQuantity,
            Expr::col(product::Column::StockQuantity).add(quantity),
        )
        .filter(product::Column::Id.eq(product_id))
        .exec(conn)
        .await?;

    ProductEntity::update_many()
        .set(product::ActiveModel {
            status: Set(ProductStatus::Active),
            ..Default::default()
        })
        .filter(product::Column::Id.eq(product_id))
        .filter(product::Column::Status.eq(ProductStatus::OutOfStock))
        .filter(product::Column::StockQuantity.gt(0))
        .exec(conn)
        .await?;

    debug!(%product_id, quantity, "Released stock");
    Ok(())
}
