//! Partial-payment settlement.
//!
//! Applies a tendered amount against an order's unpaid line items and
//! returns the items that remain unpaid. Items are consumed cheapest first in
//! whole units; a residual that no whole unit matches splits one unit into a
//! synthetic "Remainder of ..." line so the outstanding total always drops by
//! exactly the amount tendered.
//!
//! The engine is pure: it never touches storage and keeps no state between
//! calls. Persisting the result and recording the bill is the caller's job
//! (see `payments`).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::money::{Money, MoneyError};

/// Name prefix that marks a synthetic, partially-paid unit.
pub const REMAINDER_PREFIX: &str = "Remainder of ";
/// Name of the residual line created when no priced unit can absorb the
/// unmatched tender.
pub const PARTIAL_REMAINDER_NAME: &str = "Partial remainder";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettlementError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("nothing to settle: order has no outstanding items")]
    EmptyOrder,
}

impl From<MoneyError> for SettlementError {
    fn from(e: MoneyError) -> Self {
        SettlementError::InvalidAmount(e.to_string())
    }
}

/// One priced, quantified row of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub id: String,
    pub name: String,
    pub unit_price: Money,
    pub quantity: u32,
}

impl LineItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>, unit_price: Money, quantity: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            unit_price,
            quantity,
        }
    }

    pub fn line_total(&self) -> Money {
        self.unit_price.times(self.quantity)
    }

    pub fn is_remainder(&self) -> bool {
        self.name.starts_with(REMAINDER_PREFIX)
    }
}

/// Outcome of one settlement call. Never persisted as such: the caller folds
/// `updated_items` and `new_total` back into the table's order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementResult {
    pub amount_tendered: Money,
    /// Unpaid items before this call, kept for the bill ledger.
    pub previous_items: Vec<LineItem>,
    pub previous_total: Money,
    pub updated_items: Vec<LineItem>,
    pub new_total: Money,
}

impl SettlementResult {
    /// Amount actually taken off the order total.
    pub fn amount_applied(&self) -> Money {
        self.previous_total - self.new_total
    }

    /// True when the order no longer has anything meaningful left to pay.
    pub fn is_fully_settled(&self) -> bool {
        self.new_total.is_settled()
    }
}

/// Sum of `unit_price * quantity` over all items.
pub fn recompute_total(items: &[LineItem]) -> Money {
    items.iter().map(LineItem::line_total).sum()
}

/// Parse a user-entered tender, rejecting non-numeric and non-positive input.
pub fn parse_tender(raw: &str) -> Result<Money, SettlementError> {
    let amount: Money = raw.parse()?;
    validate_tender(amount)?;
    Ok(amount)
}

fn validate_tender(amount: Money) -> Result<(), SettlementError> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(SettlementError::InvalidAmount(format!(
            "tendered amount must be positive, got {amount}"
        )))
    }
}

/// Apply `amount_tendered` against `items`.
///
/// The input slice is never modified; rejected calls leave the caller's
/// order exactly as it was.
pub fn settle(items: &[LineItem], amount_tendered: Money) -> Result<SettlementResult, SettlementError> {
    validate_tender(amount_tendered)?;

    let previous_items: Vec<LineItem> = items.iter().filter(|i| i.quantity > 0).cloned().collect();
    if let Some(bad) = previous_items.iter().find(|i| i.unit_price < Money::ZERO) {
        return Err(SettlementError::InvalidAmount(format!(
            "negative unit price {} for {}",
            bad.unit_price, bad.name
        )));
    }
    let previous_total = recompute_total(&previous_items);
    if previous_items.is_empty() || !previous_total.is_positive() {
        return Err(SettlementError::EmptyOrder);
    }

    // Stable sort: equal prices keep their order, which decides the
    // cheapest-item tie-break below.
    let mut working = previous_items.clone();
    working.sort_by_key(|item| item.unit_price);
    let cheapest_original = working.first().cloned();

    let mut remaining = consume_whole_units(&mut working, amount_tendered);

    if remaining > Money::SETTLE_TOLERANCE {
        absorb_residual(&mut working, cheapest_original.as_ref(), remaining);
        remaining = Money::ZERO;
    }

    let new_total = recompute_total(&working);
    debug!(
        tendered = %amount_tendered,
        previous_total = %previous_total,
        new_total = %new_total,
        unmatched = %remaining,
        items = working.len(),
        "Settlement computed"
    );

    Ok(SettlementResult {
        amount_tendered,
        previous_items,
        previous_total,
        updated_items: working,
        new_total,
    })
}

/// Walk `working` (sorted cheapest first) and pay off whole units. Returns
/// the tender left over.
fn consume_whole_units(working: &mut Vec<LineItem>, amount_tendered: Money) -> Money {
    let mut remaining = amount_tendered;
    let mut idx = 0;

    while remaining.is_positive() {
        let Some(item) = working.get_mut(idx) else {
            break;
        };
        if item.unit_price > remaining {
            idx += 1;
            continue;
        }

        let affordable = remaining.units_affordable(item.unit_price);
        if affordable >= item.quantity {
            remaining -= item.line_total();
            // The next item shifts into this slot.
            working.remove(idx);
        } else {
            remaining -= item.unit_price.times(affordable);
            item.quantity -= affordable;
            idx += 1;
        }
    }

    remaining
}

/// Book a residual that no whole unit could absorb.
///
/// Every item still in `working` is priced above `residual` at this point,
/// so a split unit always keeps a positive price.
fn absorb_residual(working: &mut Vec<LineItem>, cheapest_original: Option<&LineItem>, residual: Money) {
    if let Some(marker) = working.iter_mut().find(|i| i.is_remainder() && i.quantity == 1) {
        marker.unit_price -= residual;
        return;
    }

    let cheapest_still_open = cheapest_original
        .and_then(|c| working.iter().position(|i| i.id == c.id))
        .filter(|&pos| working[pos].quantity > 0 && working[pos].unit_price > residual);

    // Fall back to the cheapest item that is still open when the cheapest
    // original line was consumed by the walk.
    let split_at = cheapest_still_open.or_else(|| (!working.is_empty()).then_some(0));

    match split_at {
        Some(pos) => {
            let source = &mut working[pos];
            source.quantity -= 1;
            let marker = LineItem::new(
                synthetic_id(),
                format!("{REMAINDER_PREFIX}{}", source.name),
                source.unit_price - residual,
                1,
            );
            if source.quantity == 0 {
                working.remove(pos);
            }
            working.push(marker);
        }
        None => {
            working.push(LineItem::new(synthetic_id(), PARTIAL_REMAINDER_NAME, residual, 1));
        }
    }
}

fn synthetic_id() -> String {
    format!("rem-{}-{}", Utc::now().timestamp_millis(), Uuid::new_v4().simple())
}

// ===========================================================================
// Tests
// ===========================================================================
