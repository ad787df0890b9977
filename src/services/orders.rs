use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    config::AppConfig,
    entities::{
        order::{self, Entity as OrderEntity, OrderStatus, PaymentStatus},
        order_item::{self, Entity as OrderItemEntity},
        product::ProductStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{cart, discounts, inventory, order_status, pricing},
};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, message = "Shipping address is required"))]
    pub shipping_address: String,
    #[validate(length(min = 1, message = "Billing address is required"))]
    pub billing_address: String,
    pub discount_code: Option<String>,
    pub customer_note: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderItemResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub user_id: Uuid,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub shipping: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub shipping_address: String,
    pub billing_address: String,
    pub payment_intent_id: Option<String>,
    pub customer_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub items: Vec<OrderItemResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderListResponse {
    pub orders: Vec<OrderResponse>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Order transaction coordinator.
///
/// Converts a mutable cart into an immutable, priced, stock-committed order
/// in one atomic transaction: snapshot, availability check, discount
/// validation, pricing, persistence, stock reservation, discount usage
/// increment, cart clear. Any failure rolls the whole attempt back.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            event_sender,
            config,
        }
    }

    /// Creates an order from the user's cart.
    ///
    /// Blocking from the caller's perspective: the result is only returned
    /// once the full transaction has committed. A unique collision on the
    /// generated order number is retried once with a fresh number; every
    /// other failure surfaces as-is with no partial effects.
    #[instrument(skip(self, request), fields(user_id = %user_id))]
    pub async fn create_order(
        &self,
        user_id: Uuid,
        request: CreateOrderRequest,
    ) -> Result<OrderResponse, ServiceError> {
        request.validate()?;

        let mut attempt = 0;
        let response = loop {
            let order_number = generate_order_number();
            match self.try_create(user_id, &request, &order_number).await {
                Ok(response) => break response,
                Err(e) if e.is_unique_violation() && attempt == 0 => {
                    warn!(%order_number, "Order number collision, retrying with a fresh number");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        self.event_sender
            .send_or_log(Event::OrderCreated(response.id));

        info!(order_id = %response.id, order_number = %response.order_number, "Order created");
        Ok(response)
    }

    async fn try_create(
        &self,
        user_id: Uuid,
        request: &CreateOrderRequest,
        order_number: &str,
    ) -> Result<OrderResponse, ServiceError> {
        let txn = self.db.begin().await?;

        // 1. Freeze the cart contents for this attempt.
        let snapshot = cart::build_snapshot(&txn, user_id).await?;

        // 2. Availability pre-check, naming the offending product. The
        //    authoritative check is the guarded decrement further down; this
        //    pass exists for error precision before any write happens. A
        //    product that merely ran out reports InsufficientStock, not
        //    ProductUnavailable; the latter is for retired products.
        for item in &snapshot.items {
            if item.status == ProductStatus::Inactive {
                return Err(ServiceError::ProductUnavailable {
                    product_id: item.product_id,
                    name: item.product_name.clone(),
                });
            }
            if item.stock_quantity < item.quantity {
                return Err(ServiceError::InsufficientStock {
                    product_id: item.product_id,
                    name: item.product_name.clone(),
                    available: item.stock_quantity,
                });
            }
        }

        // 3. Validate the discount against the pre-discount subtotal.
        let subtotal: Decimal = snapshot
            .items
            .iter()
            .map(|item| item.unit_price * Decimal::from(item.quantity))
            .sum();

        let discount = match &request.discount_code {
            Some(code) => Some(discounts::validate_on(&txn, code, subtotal).await?),
            None => None,
        };

        // 4. Price the snapshot.
        let quote = pricing::quote(&snapshot.items, discount.as_ref());

        // 5-6. Persist the order and its frozen line items.
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order_model = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.to_string()),
            user_id: Set(user_id),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Pending),
            subtotal: Set(quote.subtotal),
            tax: Set(quote.tax),
            shipping: Set(quote.shipping),
            discount: Set(quote.discount_amount),
            total: Set(quote.total),
            currency: Set(self.config.currency.clone()),
            shipping_address: Set(request.shipping_address.clone()),
            billing_address: Set(request.billing_address.clone()),
            discount_code_id: Set(discount.as_ref().map(|d| d.id)),
            payment_intent_id: Set(None),
            failure_reason: Set(None),
            refunded_amount: Set(None),
            customer_note: Set(request.customer_note.clone()),
            cancelled_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        }
        .insert(&txn)
        .await?;

        let mut items = Vec::with_capacity(snapshot.items.len());
        for item in &snapshot.items {
            let line_total = item.unit_price * Decimal::from(item.quantity);
            let inserted = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(item.product_id),
                product_name: Set(item.product_name.clone()),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                line_total: Set(line_total),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
            items.push(inserted);
        }

        // 7. Commit the stock decrement for every line.
        for item in &snapshot.items {
            inventory::reserve(&txn, item.product_id, item.quantity).await?;
        }

        // 8. Record the discount use.
        if let Some(discount) = &discount {
            discounts::consume_on(&txn, discount.id).await?;
        }

        // 9. Empty the cart; the cart row itself persists.
        cart::clear_items_on(&txn, snapshot.cart_id).await?;

        txn.commit().await?;

        Ok(build_response(order_model, items))
    }

    /// Fetches one of the user's orders with its items.
    #[instrument(skip(self))]
    pub async fn get_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderResponse, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .filter(order::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;

        Ok(build_response(order, items))
    }

    /// Lists the user's orders newest-first with pagination.
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<OrderListResponse, ServiceError> {
        let page = page.max(1);
        let paginator = OrderEntity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page);

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page - 1).await?;

        let mut responses = Vec::with_capacity(orders.len());
        for order in orders {
            let items = OrderItemEntity::find()
                .filter(order_item::Column::OrderId.eq(order.id))
                .all(&*self.db)
                .await?;
            responses.push(build_response(order, items));
        }

        Ok(OrderListResponse {
            orders: responses,
            total,
            page,
            per_page,
        })
    }

    /// Cancels one of the user's orders through the state machine; the
    /// transition releases the reserved stock exactly once. Orders that
    /// have shipped fail with `InvalidTransition`.
    #[instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderResponse, ServiceError> {
        let txn = self.db.begin().await?;

        let order = OrderEntity::find_by_id(order_id)
            .filter(order::Column::UserId.eq(user_id))
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let old_status = order.status;
        let updated = order_status::apply(&txn, order, OrderStatus::Cancelled).await?;

        txn.commit().await?;

        if old_status != OrderStatus::Cancelled {
            self.event_sender
                .send_or_log(Event::OrderCancelled(order_id));
            self.event_sender.send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: old_status.to_string(),
                new_status: OrderStatus::Cancelled.to_string(),
            });
        }

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;
        Ok(build_response(updated, items))
    }
}

/// Generates a human-readable, unguessable order number. Uniqueness is
/// ultimately guaranteed by the unique constraint on the column; the random
/// suffix just makes collisions negligible.
pub fn generate_order_number() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|c| (c as char).to_ascii_uppercase())
        .collect();
    format!("ORD-{}-{}", Utc::now().timestamp_millis(), suffix)
}

fn build_response(order: order::Model, items: Vec<order_item::Model>) -> OrderResponse {
    OrderResponse {
        id: order.id,
        order_number: order.order_number,
        user_id: order.user_id,
        status: order.status,
        payment_status: order.payment_status,
        subtotal: order.subtotal,
        tax: order.tax,
        shipping: order.shipping,
        discount: order.discount,
        total: order.total,
        currency: order.currency,
        shipping_address: order.shipping_address,
        billing_address: order.billing_address,
        payment_intent_id: order.payment_intent_id,
        customer_note: order.customer_note,
        created_at: order.created_at,
        items: items
            .into_iter()
            .map(|item| OrderItemResponse {
                id: item.id,
                product_id: item.product_id,
                product_name: item.product_name,
                quantity: item.quantity,
                unit_price: item.unit_price,
                line_total: item.line_total,
            })
            .collect(),
    }
}
