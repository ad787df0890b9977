use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::services::cart::SnapshotItem;
use crate::services::discounts::ValidatedDiscount;

/// VAT rate applied to the discounted subtotal.
pub const TAX_RATE: Decimal = dec!(0.19);

/// Flat shipping fee charged below the free-shipping threshold.
pub const FLAT_SHIPPING_FEE: Decimal = dec!(4.99);

/// Orders with a pre-discount subtotal above this ship for free.
pub const FREE_SHIPPING_THRESHOLD: Decimal = dec!(50.00);

/// Priced breakdown of one order-creation attempt. All figures are rounded
/// to two decimal places exactly once, at this output boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub tax: Decimal,
    pub shipping: Decimal,
    pub total: Decimal,
}

/// Computes the order totals for a cart snapshot.
///
/// Pure function: same items and discount always produce the same figures.
/// Tax is 19% of the subtotal after the discount is applied; the
/// free-shipping threshold is checked against the pre-discount subtotal.
pub fn quote(items: &[SnapshotItem], discount: Option<&ValidatedDiscount>) -> Quote {
    let subtotal: Decimal = items
        .iter()
        .map(|item| item.unit_price * Decimal::from(item.quantity))
        .sum();

    let discount_amount = discount
        .map(|d| d.amount(subtotal))
        .unwrap_or(Decimal::ZERO);

    let taxable = subtotal - discount_amount;
    let tax = taxable * TAX_RATE;
    let shipping = if subtotal > FREE_SHIPPING_THRESHOLD {
        Decimal::ZERO
    } else {
        FLAT_SHIPPING_FEE
    };
    let total = taxable + tax + shipping;

    Quote {
        subtotal: round(subtotal),
        discount_amount: round(discount_amount),
        tax: round(tax),
        shipping: round(shipping),
        total: round(total),
    }
}

fn round(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
