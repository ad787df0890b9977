/// Persistence entities for the order and payment core.
pub mod cart;
pub mod cart_item;
pub mod discount_code;
pub mod order;
pub mod order_item;
pub mod product;
pub mod webhook_event;

// Re-export entities
pub use cart::{Entity as Cart, Model as CartModel};
pub use cart_item::{Entity as CartItem, Model as CartItemModel};
pub use discount_code::{DiscountType, Entity as DiscountCode, Model as DiscountCodeModel};
pub use order::{Entity as Order, Model as OrderModel, OrderStatus, PaymentStatus};
pub use order_item::{Entity as OrderItem, Model as OrderItemModel};
pub use product::{Entity as Product, Model as ProductModel, ProductStatus};
pub use webhook_event::{Entity as WebhookEvent, Model as WebhookEventModel};
