use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Events emitted by the order core. Consumers (mailer, analytics, fulfilment)
/// subscribe on the receiving end of the channel; delivery is fire-and-forget
/// and never blocks or rolls back the transaction that produced the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Order lifecycle
    OrderCreated(Uuid),
    OrderConfirmed(Uuid),
    OrderCancelled(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },

    // Payment reconciliation
    PaymentCompleted {
        order_id: Uuid,
        payment_intent_id: String,
    },
    PaymentFailed {
        order_id: Uuid,
        reason: Option<String>,
    },
    RefundProcessed {
        order_id: Uuid,
        amount: Option<Decimal>,
    },

    // Cart activity
    CartItemAdded { cart_id: Uuid, product_id: Uuid },
    CartItemRemoved { cart_id: Uuid, item_id: Uuid },
    CartCleared(Uuid),
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event, waiting for buffer space. For consumers that want
    /// backpressure.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event without waiting. A full buffer or a missing consumer
    /// drops the event with a warning; notification delivery must never
    /// block or fail the caller.
    pub fn send_or_log(&self, event: Event) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "Event buffer full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(?event, "No event consumer, dropping event");
            }
        }
    }
}

/// Creates a connected sender/receiver pair with a bounded buffer.
pub fn channel(buffer: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(buffer);
    (EventSender::new(tx), rx)
}
