//! Payment webhook reconciler.
//!
//! Consumes verified gateway events and brings order state into agreement
//! with the gateway's view. Gateway delivery is at-least-once and unordered,
//! so every effect here is idempotent: the event id is persisted before any
//! state changes, duplicates short-circuit, and transitions that contradict
//! the current order state are logged and acknowledged rather than applied.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    QueryFilter, Set, TransactionTrait,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::{
    config::AppConfig,
    entities::{
        order::{self, Entity as OrderEntity, OrderStatus, PaymentStatus},
        webhook_event,
    },
    errors::{is_unique_violation, ServiceError},
    events::{Event, EventSender},
    services::order_status,
    services::payments::{self, GatewayEvent, GatewayEventKind},
};

#[derive(Clone)]
pub struct WebhookReconciler {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl WebhookReconciler {
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

    /// Verifies a raw webhook delivery and reconciles it. Signature failures
    /// are rejected outright; everything past verification is acknowledged.
    #[instrument(skip(self, raw_body, signature_header))]
    pub async fn handle_raw(
        &self,
        raw_body: &[u8],
        signature_header: &str,
    ) -> Result<(), ServiceError> {
        let secret = self
            .config
            .payment_webhook_secret
            .as_deref()
            .ok_or_else(|| {
                ServiceError::InternalError("payment webhook secret not configured".to_string())
            })?;

        let event = payments::verify_webhook_signature(
            raw_body,
            signature_header,
            secret,
            self.config.payment_webhook_tolerance_secs,
        )?;
        self.handle(event).await
    }

    /// Reconciles one verified gateway event.
    ///
    /// Returns `Ok` for anomalies (unknown event type, unknown order,
    /// contradictory state): they are logged for human review and the event
    /// is acknowledged so the gateway stops redelivering it. Only
    /// infrastructure failures propagate.
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    pub async fn handle(&self, event: GatewayEvent) -> Result<(), ServiceError> {
        if let GatewayEventKind::Unknown(event_type) = &event.kind {
            info!(%event_type, "Ignoring unhandled gateway event type");
            return Ok(());
        }

        let txn = self.db.begin().await?;

        if !self.mark_processed(&txn, &event).await? {
            info!("Webhook event already processed");
            return Ok(());
        }

        let Some(order) = self.find_order(&txn, &event).await? else {
            warn!(
                intent = ?event.payment_intent_id,
                order = ?event.order_id,
                "Webhook event references no known order"
            );
            txn.commit().await?;
            return Ok(());
        };

        let order_id = order.id;
        let mut notifications = Vec::new();

        match event.kind {
            GatewayEventKind::PaymentSucceeded => {
                self.on_succeeded(&txn, order, &event, &mut notifications)
                    .await?
            }
            GatewayEventKind::PaymentFailed | GatewayEventKind::PaymentCanceled => {
                self.on_failed(&txn, order, &event, &mut notifications)
                    .await?
            }
            GatewayEventKind::ChargeRefunded => {
                self.on_refunded(&txn, order, &event, &mut notifications)
                    .await?
            }
            GatewayEventKind::Unknown(_) => unreachable!("filtered above"),
        }

        txn.commit().await?;

        for notification in notifications {
            self.event_sender.send_or_log(notification);
        }

        info!(%order_id, "Webhook event reconciled");
        Ok(())
    }

    /// Records the event id. Returns false when a previous delivery already
    /// recorded it, which is the idempotency short-circuit.
    async fn mark_processed(
        &self,
        txn: &DatabaseTransaction,
        event: &GatewayEvent,
    ) -> Result<bool, ServiceError> {
        let record = webhook_event::ActiveModel {
            event_id: Set(event.id.clone()),
            event_type: Set(kind_label(&event.kind).to_string()),
            order_id: Set(event.order_id),
            processed_at: Set(Utc::now()),
        };

        match record.insert(txn).await {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Locates the order an event refers to, preferring the order id the
    /// gateway echoes back in metadata and falling back to the intent id.
    async fn find_order(
        &self,
        txn: &DatabaseTransaction,
        event: &GatewayEvent,
    ) -> Result<Option<order::Model>, ServiceError> {
        if let Some(order_id) = event.order_id {
            if let Some(order) = OrderEntity::find_by_id(order_id).one(txn).await? {
                return Ok(Some(order));
            }
        }
        if let Some(intent_id) = &event.payment_intent_id {
            return Ok(OrderEntity::find()
                .filter(order::Column::PaymentIntentId.eq(intent_id.clone()))
                .one(txn)
                .await?);
        }
        Ok(None)
    }

    async fn on_succeeded(
        &self,
        txn: &DatabaseTransaction,
        order: order::Model,
        event: &GatewayEvent,
        notifications: &mut Vec<Event>,
    ) -> Result<(), ServiceError> {
        if order.payment_status == PaymentStatus::Refunded
            || order.status == OrderStatus::Refunded
        {
            warn!(
                order_id = %order.id,
                "Payment-succeeded event for an already refunded order, ignoring"
            );
            return Ok(());
        }

        let order_id = order.id;
        let version = order.version;
        let intent_id = event.payment_intent_id.clone();

        let mut active: order::ActiveModel = order.into();
        active.payment_status = Set(PaymentStatus::Completed);
        if let Some(intent_id) = &intent_id {
            active.payment_intent_id = Set(Some(intent_id.clone()));
        }
        active.updated_at = Set(Utc::now());
        active.version = Set(version + 1);
        let updated = active.update(txn).await?;

        if updated.status == OrderStatus::Pending {
            order_status::apply(txn, updated, OrderStatus::Confirmed).await?;
            notifications.push(Event::OrderConfirmed(order_id));
        } else if updated.status != OrderStatus::Confirmed {
            warn!(
                %order_id,
                status = %updated.status,
                "Payment succeeded for an order past confirmation"
            );
        }

        if let Some(intent_id) = intent_id {
            notifications.push(Event::PaymentCompleted {
                order_id,
                payment_intent_id: intent_id,
            });
        }
        Ok(())
    }

    async fn on_failed(
        &self,
        txn: &DatabaseTransaction,
        order: order::Model,
        event: &GatewayEvent,
        notifications: &mut Vec<Event>,
    ) -> Result<(), ServiceError> {
        if matches!(
            order.payment_status,
            PaymentStatus::Completed | PaymentStatus::Refunded
        ) {
            warn!(
                order_id = %order.id,
                payment_status = %order.payment_status,
                "Payment-failed event contradicts settled payment, ignoring"
            );
            return Ok(());
        }

        let order_id = order.id;
        let previous_status = order.status;
        let version = order.version;

        let mut active: order::ActiveModel = order.into();
        active.payment_status = Set(PaymentStatus::Failed);
        if let Some(reason) = &event.failure_reason {
            active.failure_reason = Set(Some(reason.clone()));
        }
        active.updated_at = Set(Utc::now());
        active.version = Set(version + 1);
        let updated = active.update(txn).await?;

        if is_cancellable(previous_status) {
            order_status::apply(txn, updated, OrderStatus::Cancelled).await?;
            notifications.push(Event::OrderCancelled(order_id));
        } else if previous_status != OrderStatus::Cancelled {
            warn!(
                %order_id,
                status = %previous_status,
                "Payment failed for an order that can no longer be cancelled"
            );
        }

        notifications.push(Event::PaymentFailed {
            order_id,
            reason: event.failure_reason.clone(),
        });
        Ok(())
    }

    async fn on_refunded(
        &self,
        txn: &DatabaseTransaction,
        order: order::Model,
        event: &GatewayEvent,
        notifications: &mut Vec<Event>,
    ) -> Result<(), ServiceError> {
        if order.payment_status != PaymentStatus::Completed {
            warn!(
                order_id = %order.id,
                payment_status = %order.payment_status,
                "Refund event for a payment that never completed, ignoring"
            );
            return Ok(());
        }

        let order_id = order.id;

        // Transition first, while payment_status still proves money moved.
        // Entering Refunded never re-releases stock, even after Cancelled.
        let updated = order_status::apply(txn, order, OrderStatus::Refunded).await?;
        let version = updated.version;

        let mut active: order::ActiveModel = updated.into();
        active.payment_status = Set(PaymentStatus::Refunded);
        active.refunded_amount = Set(event.amount_refunded);
        active.updated_at = Set(Utc::now());
        active.version = Set(version + 1);
        active.update(txn).await?;

        notifications.push(Event::RefundProcessed {
            order_id,
            amount: event.amount_refunded,
        });
        Ok(())
    }
}

fn is_cancellable(status: OrderStatus) -> bool {
    matches!(
        status,
        OrderStatus::Pending | OrderStatus::Confirmed | OrderStatus::Processing
    )
}

fn kind_label(kind: &GatewayEventKind) -> &str {
    match kind {
        GatewayEventKind::PaymentSucceeded => "payment_intent.succeeded",
        GatewayEventKind::PaymentFailed => "payment_intent.payment_failed",
        GatewayEventKind::PaymentCanceled => "payment_intent.canceled",
        GatewayEventKind::ChargeRefunded => "charge.refunded",
        GatewayEventKind::Unknown(other) => other,
    }
}
