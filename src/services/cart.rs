use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    entities::{
        cart::{self, Entity as CartEntity},
        cart_item::{self, Entity as CartItemEntity},
        product::{Entity as ProductEntity, ProductStatus},
    },
    errors::{is_unique_violation, ServiceError},
    events::{Event, EventSender},
};

/// One cart line joined with live product data, frozen for the duration of
/// a single order-creation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotItem {
    pub item_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub stock_quantity: i32,
    pub status: ProductStatus,
}

/// A user's cart contents at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartSnapshot {
    pub cart_id: Uuid,
    pub user_id: Uuid,
    pub items: Vec<SnapshotItem>,
}

/// Loads the user's cart joined with current product price, stock and
/// status. Fails with [`ServiceError::EmptyCart`] when the user has no cart
/// or the cart has no items. Runs on any connection so the order
/// coordinator can snapshot inside its transaction.
pub async fn build_snapshot<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
) -> Result<CartSnapshot, ServiceError> {
    let cart = CartEntity::find()
        .filter(cart::Column::UserId.eq(user_id))
        .one(conn)
        .await?
        .ok_or(ServiceError::EmptyCart)?;

    let rows = CartItemEntity::find()
        .filter(cart_item::Column::CartId.eq(cart.id))
        .find_also_related(ProductEntity)
        .all(conn)
        .await?;

    if rows.is_empty() {
        return Err(ServiceError::EmptyCart);
    }

    let mut items = Vec::with_capacity(rows.len());
    for (item, product) in rows {
        let product = product.ok_or_else(|| {
            ServiceError::InternalError(format!(
                "Cart item {} references missing product {}",
                item.id, item.product_id
            ))
        })?;
        items.push(SnapshotItem {
            item_id: item.id,
            product_id: product.id,
            product_name: product.name,
            unit_price: product.price,
            quantity: item.quantity,
            stock_quantity: product.stock_quantity,
            status: product.status,
        });
    }

    Ok(CartSnapshot {
        cart_id: cart.id,
        user_id,
        items,
    })
}

/// Deletes all items of a cart; the cart row itself persists, empty.
pub(crate) async fn clear_items_on<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<(), ServiceError> {
    CartItemEntity::delete_many()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .exec(conn)
        .await?;
    Ok(())
}

/// Shopping cart service: one cart per user, created lazily on first access.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Returns the user's cart, creating it on first access. Idempotent:
    /// a concurrent create loses the unique-key race and re-reads instead.
    #[instrument(skip(self))]
    pub async fn get_or_create_cart(&self, user_id: Uuid) -> Result<cart::Model, ServiceError> {
        if let Some(existing) = CartEntity::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
        {
            return Ok(existing);
        }

        let now = Utc::now();
        let fresh = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match fresh.insert(&*self.db).await {
            Ok(created) => Ok(created),
            Err(e) if is_unique_violation(&e) => CartEntity::find()
                .filter(cart::Column::UserId.eq(user_id))
                .one(&*self.db)
                .await?
                .ok_or_else(|| {
                    ServiceError::InternalError(format!("Cart for user {} vanished", user_id))
                }),
            Err(e) => Err(e.into()),
        }
    }

    /// Adds a product to the user's cart, merging the quantity when the
    /// product is already in it.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<cart_item::Model, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let cart = self.get_or_create_cart(user_id).await?;

        let txn = self.db.begin().await?;

        let product = ProductEntity::find_by_id(product_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

        if product.status == ProductStatus::Inactive {
            return Err(ServiceError::ProductUnavailable {
                product_id,
                name: product.name,
            });
        }

        let existing = CartItemEntity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&txn)
            .await?;

        let item = if let Some(item) = existing {
            let merged = item.quantity + quantity;
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(merged);
            item.updated_at = Set(Utc::now());
            item.update(&txn).await?
        } else {
            let now = Utc::now();
            cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart.id),
                product_id: Set(product_id),
                quantity: Set(quantity),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await?
        };

        txn.commit().await?;

        self.event_sender.send_or_log(Event::CartItemAdded {
            cart_id: cart.id,
            product_id,
        });

        info!(cart_id = %cart.id, %product_id, quantity, "Added item to cart");
        Ok(item)
    }

    /// Updates a cart item's quantity; zero or negative removes the item.
    #[instrument(skip(self))]
    pub async fn update_item_quantity(
        &self,
        user_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        let item = self.owned_item(user_id, item_id).await?;

        if quantity <= 0 {
            return self.remove_item(user_id, item_id).await;
        }

        let mut item: cart_item::ActiveModel = item.into();
        item.quantity = Set(quantity);
        item.updated_at = Set(Utc::now());
        item.update(&*self.db).await?;
        Ok(())
    }

    /// Removes an item from the user's cart.
    #[instrument(skip(self))]
    pub async fn remove_item(&self, user_id: Uuid, item_id: Uuid) -> Result<(), ServiceError> {
        let item = self.owned_item(user_id, item_id).await?;
        let cart_id = item.cart_id;

        CartItemEntity::delete_by_id(item.id).exec(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::CartItemRemoved { cart_id, item_id });
        Ok(())
    }

    /// Empties the user's cart.
    #[instrument(skip(self))]
    pub async fn clear(&self, user_id: Uuid) -> Result<(), ServiceError> {
        let cart = self.get_or_create_cart(user_id).await?;
        clear_items_on(&*self.db, cart.id).await?;

        self.event_sender.send_or_log(Event::CartCleared(cart.id));
        Ok(())
    }

    /// Returns the cart snapshot for display purposes.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, user_id: Uuid) -> Result<CartSnapshot, ServiceError> {
        let cart = self.get_or_create_cart(user_id).await?;
        match build_snapshot(&*self.db, user_id).await {
            Ok(snapshot) => Ok(snapshot),
            Err(ServiceError::EmptyCart) => Ok(CartSnapshot {
                cart_id: cart.id,
                user_id,
                items: Vec::new(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Fetches a cart item and verifies it belongs to the user's cart.
    async fn owned_item(
        &self,
        user_id: Uuid,
        item_id: Uuid,
    ) -> Result<cart_item::Model, ServiceError> {
        let item = CartItemEntity::find_by_id(item_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", item_id)))?;

        let cart = CartEntity::find_by_id(item.cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", item.cart_id)))?;

        if cart.user_id != user_id {
            return Err(ServiceError::NotFound(format!(
                "Cart item {} not found",
                item_id
            )));
        }
        Ok(item)
    }
}
