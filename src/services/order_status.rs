//! Order state machine.
//!
//! Every path that mutates an order's status — user cancellation, admin
//! updates, webhook reconciliation — routes through [`apply`], so concurrent
//! writers always leave the order in a state the transition table allows.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use tracing::info;

use crate::{
    entities::{
        order::{self, OrderStatus, PaymentStatus},
        order_item::{self, Entity as OrderItemEntity},
    },
    errors::ServiceError,
    services::inventory,
};

/// Returns whether the transition is in the allowed table.
///
/// The forward chain is `Pending -> Confirmed -> Processing -> Shipped ->
/// Delivered`. `Cancelled` is reachable from the first three states only;
/// `Refunded` is reachable from any state once money has actually moved
/// (`payment_status == Completed`). A transition to the current state is
/// legal and treated as a no-op by [`apply`].
pub fn is_legal_transition(
    from: OrderStatus,
    to: OrderStatus,
    payment_status: PaymentStatus,
) -> bool {
    use OrderStatus::*;

    if from == to {
        return true;
    }

    match (from, to) {
        (Pending, Confirmed) => true,
        (Confirmed, Processing) => true,
        (Processing, Shipped) => true,
        (Shipped, Delivered) => true,
        (Pending | Confirmed | Processing, Cancelled) => true,
        (_, Refunded) => payment_status == PaymentStatus::Completed,
        _ => false,
    }
}

/// Applies a status transition inside the caller's transaction.
///
/// Re-entering the current status is a no-op, which is what makes retried
/// admin calls and redelivered webhooks safe. The first (and therefore only)
/// transition into `Cancelled` releases the stock of every order item and
/// stamps `cancelled_at`; entering `Refunded` never re-releases stock.
pub async fn apply<C: ConnectionTrait>(
    conn: &C,
    order: order::Model,
    to: OrderStatus,
) -> Result<order::Model, ServiceError> {
    if order.status == to {
        return Ok(order);
    }

    if !is_legal_transition(order.status, to, order.payment_status) {
        return Err(ServiceError::InvalidTransition {
            from: order.status,
            to,
        });
    }

    if to == OrderStatus::Cancelled {
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(conn)
            .await?;
        for item in &items {
            inventory::release(conn, item.product_id, item.quantity).await?;
        }
    }

    let order_id = order.id;
    let from = order.status;
    let version = order.version;

    let mut active: order::ActiveModel = order.into();
    active.status = Set(to);
    active.updated_at = Set(Utc::now());
    active.version = Set(version + 1);
    if to == OrderStatus::Cancelled {
        active.cancelled_at = Set(Some(Utc::now()));
    }
    let updated = active.update(conn).await?;

    info!(%order_id, %from, %to, "Order status transition applied");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrderStatus::*;

    #[test]
    fn forward_chain_is_legal() {
        for (from, to) in [
            (Pending, Confirmed),
            (Confirmed, Processing),
            (Processing, Shipped),
            (Shipped, Delivered),
        ] {
            assert!(is_legal_transition(from, to, PaymentStatus::Pending));
        }
    }

    #[test]
    fn cancellation_is_limited_to_early_states() {
        for from in [Pending, Confirmed, Processing] {
            assert!(is_legal_transition(from, Cancelled, PaymentStatus::Pending));
        }
        for from in [Shipped, Delivered] {
            assert!(!is_legal_transition(from, Cancelled, PaymentStatus::Completed));
        }
    }

    #[test]
    fn refund_requires_completed_payment() {
        assert!(is_legal_transition(
            Delivered,
            Refunded,
            PaymentStatus::Completed
        ));
        assert!(is_legal_transition(
            Cancelled,
            Refunded,
            PaymentStatus::Completed
        ));
        assert!(!is_legal_transition(
            Delivered,
            Refunded,
            PaymentStatus::Pending
        ));
        assert!(!is_legal_transition(
            Pending,
            Refunded,
            PaymentStatus::Failed
        ));
    }

    #[test]
    fn skipping_states_is_illegal() {
        assert!(!is_legal_transition(Pending, Shipped, PaymentStatus::Completed));
        assert!(!is_legal_transition(Pending, Processing, PaymentStatus::Pending));
        assert!(!is_legal_transition(Delivered, Pending, PaymentStatus::Completed));
    }

    #[test]
    fn same_state_is_a_no_op_not_an_error() {
        assert!(is_legal_transition(Cancelled, Cancelled, PaymentStatus::Failed));
        assert!(is_legal_transition(Confirmed, Confirmed, PaymentStatus::Completed));
    }
}
