use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flat-rate shipping configuration of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShippingRule {
    pub flat_cents: i64,
    pub free_threshold_cents: Option<i64>,
}

impl ShippingRule {
    /// Shipping owed for a given subtotal. Empty carts never pay shipping.
    pub fn shipping_for(&self, subtotal_cents: i64, item_count: i64) -> i64 {
        if item_count == 0 {
            return 0;
        }
        match self.free_threshold_cents {
            Some(threshold) if subtotal_cents >= threshold => 0,
            _ => self.flat_cents,
        }
    }
}

/// Single priced line used as pricing input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricedLine {
    pub unit_price_cents: i64,
    pub quantity: i64,
}

impl PricedLine {
    pub fn line_total(&self) -> Result<i64, PricingError> {
        self.unit_price_cents
            .checked_mul(self.quantity)
            .ok_or(PricingError::Overflow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Totals {
    pub item_count: i64,
    pub subtotal_cents: i64,
    pub shipping_cents: i64,
    pub total_cents: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PricingError {
    #[error("order amount exceeds the supported range")]
    Overflow,
}

/// Computes cart/order totals from stored unit prices.
pub fn compute_totals(lines: &[PricedLine], shipping: ShippingRule) -> Result<Totals, PricingError> {
    let mut subtotal: i64 = 0;
    let mut item_count: i64 = 0;
    for line in lines {
        subtotal = subtotal
            .checked_add(line.line_total()?)
            .ok_or(PricingError::Overflow)?;
        item_count = item_count
            .checked_add(line.quantity)
            .ok_or(PricingError::Overflow)?;
    }

    let shipping_cents = shipping.shipping_for(subtotal, item_count);
    let total_cents = subtotal
        .checked_add(shipping_cents)
        .ok_or(PricingError::Overflow)?;

    Ok(Totals {
        item_count,
        subtotal_cents: subtotal,
        shipping_cents,
        total_cents,
    })
}
