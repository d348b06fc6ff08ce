//! Payment flows for table orders.
//!
//! Each flow reads the table's open order, computes what remains unpaid,
//! then writes the remaining items and the bill in one `BEGIN IMMEDIATE`
//! transaction while holding the connection lock, so two payments for the
//! same table can never interleave. When the outstanding total reaches the
//! one-cent tolerance the table is reset in the same transaction.
//!
//! If the write-back fails, the computed result is handed back inside
//! `PaymentError::Persistence` so the caller can retry the write without
//! settling the tender a second time. A retry only writes while the order
//! still matches the snapshot the payment was computed from.

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::bills::{self, Bill, BillKind, PaymentMethod};
use crate::events::TableEvent;
use crate::money::Money;
use crate::settlement::{self, recompute_total, LineItem, SettlementError, SettlementResult};
use crate::tables::{self, Table};
use crate::AppContext;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error(transparent)]
    Settlement(#[from] SettlementError),
    #[error("Table not found: {0}")]
    TableNotFound(String),
    #[error("invalid payment: {0}")]
    InvalidInput(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("order on table {0} changed since the payment was computed")]
    Conflict(String),
    #[error("failed to save payment: {reason}")]
    Persistence {
        reason: String,
        pending: Box<PendingWriteBack>,
    },
}

/// A computed payment that has not been written yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWriteBack {
    pub table_id: String,
    /// Order items the payment was computed against.
    pub previous_items: Vec<LineItem>,
    pub updated_items: Vec<LineItem>,
    pub bill: Bill,
    pub settlement: Option<SettlementResult>,
}

impl PendingWriteBack {
    pub fn new_total(&self) -> Money {
        recompute_total(&self.updated_items)
    }
}

/// Payer's pick for a custom split: `quantity` units of one order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSelection {
    pub item_id: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    pub bill: Bill,
    pub settlement: Option<SettlementResult>,
    pub table: Table,
    pub table_settled: bool,
}

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

/// Pay an arbitrary amount against a table's order.
///
/// A tender at or above the outstanding total closes the order; cash
/// overpayment is booked as change, card overpayment is rejected.
pub fn pay_partial(
    ctx: &AppContext,
    table_id: &str,
    tendered: Money,
    method: PaymentMethod,
) -> Result<PaymentReceipt, PaymentError> {
    with_table(ctx, table_id, |table| plan_tender(table, tendered, method))
}

/// Pay the whole outstanding total. `tendered` defaults to the exact total.
pub fn pay_full(
    ctx: &AppContext,
    table_id: &str,
    method: PaymentMethod,
    tendered: Option<Money>,
) -> Result<PaymentReceipt, PaymentError> {
    with_table(ctx, table_id, |table| {
        let tendered = tendered.unwrap_or(table.total);
        if tendered < table.total {
            return Err(PaymentError::InvalidInput(format!(
                "tendered {tendered} does not cover the outstanding {}",
                table.total
            )));
        }
        plan_tender(table, tendered, method)
    })
}

/// Pay for specific units of specific lines (custom split).
pub fn pay_items(
    ctx: &AppContext,
    table_id: &str,
    selections: &[ItemSelection],
    method: PaymentMethod,
    tendered: Option<Money>,
) -> Result<PaymentReceipt, PaymentError> {
    with_table(ctx, table_id, |table| plan_items(table, selections, method, tendered))
}

/// Write an already computed payment after a `Persistence` failure.
///
/// Fails with `Conflict` when the table's order changed in between; the
/// tender then has to be settled again against the current order. The bill
/// is dated at the moment it is finally recorded.
pub fn retry_write_back(
    ctx: &AppContext,
    mut pending: PendingWriteBack,
) -> Result<PaymentReceipt, PaymentError> {
    let receipt = {
        let conn = ctx
            .db
            .conn
            .lock()
            .map_err(|e| PaymentError::Storage(e.to_string()))?;
        if bill_exists(&conn, &pending.bill.id)? {
            return Err(PaymentError::InvalidInput(format!(
                "bill {} was already recorded",
                pending.bill.id
            )));
        }
        pending.bill.created_at = Utc::now().to_rfc3339();
        let receipt = write_back(&conn, pending)?;
        ctx.cache.put(receipt.table.clone());
        receipt
    };
    publish(ctx, &receipt);
    Ok(receipt)
}

fn with_table<F>(ctx: &AppContext, table_id: &str, plan: F) -> Result<PaymentReceipt, PaymentError>
where
    F: FnOnce(&Table) -> Result<PendingWriteBack, PaymentError>,
{
    let receipt = {
        let conn = ctx
            .db
            .conn
            .lock()
            .map_err(|e| PaymentError::Storage(e.to_string()))?;
        let table = tables::load_table(&conn, table_id)
            .map_err(PaymentError::Storage)?
            .ok_or_else(|| PaymentError::TableNotFound(table_id.to_string()))?;
        let pending = plan(&table)?;
        let receipt = write_back(&conn, pending)?;
        // Cache writes stay ordered with the database writes.
        ctx.cache.put(receipt.table.clone());
        receipt
    };
    publish(ctx, &receipt);
    Ok(receipt)
}

// ---------------------------------------------------------------------------
// Planning (no I/O)
// ---------------------------------------------------------------------------

fn plan_tender(
    table: &Table,
    tendered: Money,
    method: PaymentMethod,
) -> Result<PendingWriteBack, PaymentError> {
    if !tendered.is_positive() {
        return Err(SettlementError::InvalidAmount(format!(
            "tendered amount must be positive, got {tendered}"
        ))
        .into());
    }
    let outstanding = recompute_total(&table.items);
    if !outstanding.is_positive() {
        return Err(SettlementError::EmptyOrder.into());
    }

    let (applied, kind) = if tendered >= outstanding {
        if tendered > outstanding && method != PaymentMethod::Cash {
            return Err(PaymentError::InvalidInput(format!(
                "{} payment of {tendered} exceeds the outstanding {outstanding}",
                method.as_str()
            )));
        }
        (outstanding, BillKind::Full)
    } else {
        (tendered, BillKind::Partial)
    };

    let result = settlement::settle(&table.items, applied)?;
    let bill = Bill::new(
        &table.id,
        applied,
        tendered,
        method,
        kind,
        result.previous_items.clone(),
    );

    Ok(PendingWriteBack {
        table_id: table.id.clone(),
        previous_items: table.items.clone(),
        updated_items: result.updated_items.clone(),
        bill,
        settlement: Some(result),
    })
}

fn plan_items(
    table: &Table,
    selections: &[ItemSelection],
    method: PaymentMethod,
    tendered: Option<Money>,
) -> Result<PendingWriteBack, PaymentError> {
    if selections.is_empty() {
        return Err(PaymentError::InvalidInput("no items selected".into()));
    }

    let mut remaining = table.items.clone();
    let mut paid: Vec<LineItem> = Vec::new();

    for selection in selections.iter().filter(|s| s.quantity > 0) {
        let line = remaining
            .iter_mut()
            .find(|i| i.id == selection.item_id)
            .ok_or_else(|| {
                PaymentError::InvalidInput(format!("item {} is not on the order", selection.item_id))
            })?;
        if selection.quantity > line.quantity {
            return Err(PaymentError::InvalidInput(format!(
                "only {} of {} left to pay",
                line.quantity, line.name
            )));
        }
        line.quantity -= selection.quantity;
        paid.push(LineItem::new(
            line.id.clone(),
            line.name.clone(),
            line.unit_price,
            selection.quantity,
        ));
    }

    let amount = recompute_total(&paid);
    if !amount.is_positive() {
        return Err(PaymentError::InvalidInput(
            "selected items have no value".into(),
        ));
    }
    let tendered = tendered.unwrap_or(amount);
    if tendered < amount {
        return Err(PaymentError::InvalidInput(format!(
            "tendered {tendered} does not cover the selected {amount}"
        )));
    }
    if tendered > amount && method != PaymentMethod::Cash {
        return Err(PaymentError::InvalidInput(format!(
            "{} payment of {tendered} exceeds the selected {amount}",
            method.as_str()
        )));
    }

    remaining.retain(|i| i.quantity > 0);
    let bill = Bill::new(&table.id, amount, tendered, method, BillKind::CustomSplit, paid);

    Ok(PendingWriteBack {
        table_id: table.id.clone(),
        previous_items: table.items.clone(),
        updated_items: remaining,
        bill,
        settlement: None,
    })
}

// ---------------------------------------------------------------------------
// Write-back
// ---------------------------------------------------------------------------

fn bill_exists(conn: &Connection, bill_id: &str) -> Result<bool, PaymentError> {
    conn.query_row(
        "SELECT COUNT(*) FROM bills WHERE id = ?1",
        rusqlite::params![bill_id],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
    .map_err(|e| PaymentError::Storage(format!("query bill: {e}")))
}

fn write_back(conn: &Connection, pending: PendingWriteBack) -> Result<PaymentReceipt, PaymentError> {
    let fail = |reason: String, pending: PendingWriteBack| {
        error!(table_id = %pending.table_id, bill_id = %pending.bill.id, error = %reason, "Payment write-back failed");
        PaymentError::Persistence {
            reason,
            pending: Box::new(pending),
        }
    };

    if let Err(e) = conn.execute_batch("BEGIN IMMEDIATE") {
        return Err(fail(format!("begin transaction: {e}"), pending));
    }

    let current = match tables::load_table(conn, &pending.table_id) {
        Ok(Some(table)) => table,
        Ok(None) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(PaymentError::TableNotFound(pending.table_id));
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(fail(e, pending));
        }
    };
    if current.items != pending.previous_items {
        let _ = conn.execute_batch("ROLLBACK");
        warn!(table_id = %pending.table_id, bill_id = %pending.bill.id, "Order changed before payment write-back");
        return Err(PaymentError::Conflict(pending.table_id));
    }

    let result = (|| -> Result<(Table, bool), String> {
        let mut table = current;
        table.set_items(pending.updated_items.clone());
        tables::store_table(conn, &table)?;
        bills::insert_bill(conn, &pending.bill)?;
        let reload = |id: &str| -> Result<Table, String> {
            tables::load_table(conn, id)?.ok_or_else(|| format!("Table not found: {id}"))
        };
        table = reload(&pending.table_id)?;

        let settled = table.total.is_settled();
        if settled {
            tables::clear_table(conn, &table.id)?;
            let mut after = reload(&table.id)?;
            if after.has_open_order() {
                warn!(table_id = %table.id, "Table still populated after reset, forcing clear");
                tables::clear_table(conn, &table.id)?;
                after = reload(&table.id)?;
                if after.has_open_order() {
                    return Err(format!("table {} could not be cleared", table.id));
                }
            }
            table = after;
        }
        Ok((table, settled))
    })();

    match result {
        Ok((table, settled)) => {
            if let Err(e) = conn.execute_batch("COMMIT") {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(fail(format!("commit: {e}"), pending));
            }
            info!(
                table_id = %table.id,
                bill_id = %pending.bill.id,
                amount = %pending.bill.amount,
                change = %pending.bill.change,
                method = pending.bill.method.as_str(),
                kind = pending.bill.kind.as_str(),
                remaining = %pending.new_total(),
                settled,
                "Payment recorded"
            );
            Ok(PaymentReceipt {
                bill: pending.bill,
                settlement: pending.settlement,
                table,
                table_settled: settled,
            })
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(fail(e, pending))
        }
    }
}

fn publish(ctx: &AppContext, receipt: &PaymentReceipt) {
    let table_id = receipt.table.id.clone();
    ctx.events.notify(TableEvent::Paid {
        table_id: table_id.clone(),
        bill_id: receipt.bill.id.clone(),
        amount: receipt.bill.amount,
        new_total: receipt.table.total,
    });
    if receipt.table_settled {
        ctx.events.notify(TableEvent::Reset { table_id });
    }
}

// ---------------------------------------------------------------------------
// JSON payload entry point
// ---------------------------------------------------------------------------

/// Record a table payment from a screen payload.
///
/// Accepts `tableId`, `method`, and either `items` (`[{itemId, quantity}]`
/// for a custom split) or `amount` (number or decimal string). `full: true`
/// pays the whole outstanding total. `cashReceived` sets the tender for
/// full and item payments.
pub fn record_table_payment(ctx: &AppContext, payload: &Value) -> Result<Value, String> {
    let table_id = str_field(payload, "tableId")
        .or_else(|| str_field(payload, "table_id"))
        .ok_or("Missing tableId")?;
    let method = PaymentMethod::parse(&str_field(payload, "method").ok_or("Missing method")?)?;
    let tendered = money_field(payload, "cashReceived")
        .or_else(|| money_field(payload, "cash_received"))
        .transpose()?;

    let receipt = if let Some(raw_items) = payload.get("items").filter(|v| !v.is_null()) {
        let selections: Vec<ItemSelection> = serde_json::from_value(raw_items.clone())
            .map_err(|e| format!("Invalid items: {e}"))?;
        pay_items(ctx, &table_id, &selections, method, tendered)
    } else if payload.get("full").and_then(Value::as_bool).unwrap_or(false) {
        pay_full(ctx, &table_id, method, tendered)
    } else {
        let amount = money_field(payload, "amount")
            .transpose()?
            .ok_or("Missing amount")?;
        pay_partial(ctx, &table_id, amount, method)
    }
    .map_err(|e| e.to_string())?;

    Ok(serde_json::json!({
        "success": true,
        "billId": receipt.bill.id,
        "amount": receipt.bill.amount,
        "change": receipt.bill.change,
        "newTotal": receipt.table.total,
        "tableSettled": receipt.table_settled,
        "message": format!("Payment of {} recorded", receipt.bill.amount),
    }))
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn money_field(v: &Value, key: &str) -> Option<Result<Money, String>> {
    match v.get(key)? {
        Value::Number(n) => Some(
            n.as_f64()
                .ok_or_else(|| format!("{key} is not a number"))
                .and_then(|f| Money::from_major(f).map_err(|e| format!("{key}: {e}"))),
        ),
        Value::String(s) => Some(settlement::parse_tender(s).map_err(|e| format!("{key}: {e}"))),
        Value::Null => None,
        other => Some(Err(format!("{key} is not a number: {other}"))),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
