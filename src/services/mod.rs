pub mod cart;
pub mod discounts;
pub mod inventory;
pub mod order_status;
pub mod orders;
pub mod payments;
pub mod pricing;
pub mod webhooks;

pub use cart::{CartService, CartSnapshot, SnapshotItem};
pub use discounts::{DiscountService, ValidatedDiscount};
pub use orders::{CreateOrderRequest, OrderResponse, OrderService};
pub use payments::{GatewayEvent, GatewayEventKind, PaymentGateway, PaymentService};
pub use pricing::Quote;
pub use webhooks::WebhookReconciler;
