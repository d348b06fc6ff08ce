//! Bill ledger and sales journal.
//!
//! Every payment taken at a table becomes one immutable `bills` row: the
//! amount applied to the order, what was tendered, the change handed back,
//! and a snapshot of the items it was paid against. The journal queries
//! read the same rows back, optionally filtered by table and time window.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::money::Money;
use crate::settlement::LineItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Card,
    Other,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cash" => Ok(PaymentMethod::Cash),
            "card" => Ok(PaymentMethod::Card),
            "other" => Ok(PaymentMethod::Other),
            other => Err(format!(
                "Invalid method: {other}. Must be cash, card, or other"
            )),
        }
    }
}

/// How a bill relates to the table's order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillKind {
    /// Closed the whole outstanding order in one go.
    Full,
    /// Amount-based partial payment.
    Partial,
    /// Payer picked specific items.
    CustomSplit,
}

impl BillKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BillKind::Full => "full",
            BillKind::Partial => "partial",
            BillKind::CustomSplit => "custom_split",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw {
            "full" => BillKind::Full,
            "custom_split" => BillKind::CustomSplit,
            _ => BillKind::Partial,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bill {
    pub id: String,
    pub table_id: String,
    /// Amount taken off the order.
    pub amount: Money,
    pub tendered: Money,
    pub change: Money,
    pub method: PaymentMethod,
    pub kind: BillKind,
    pub items: Vec<LineItem>,
    pub created_at: String,
    pub z_report_id: Option<String>,
}

impl Bill {
    /// Build a new, not yet recorded bill stamped with a fresh id and the
    /// current time.
    pub fn new(
        table_id: &str,
        amount: Money,
        tendered: Money,
        method: PaymentMethod,
        kind: BillKind,
        items: Vec<LineItem>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            table_id: table_id.to_string(),
            amount,
            tendered,
            change: if tendered > amount {
                tendered - amount
            } else {
                Money::ZERO
            },
            method,
            kind,
            items,
            created_at: Utc::now().to_rfc3339(),
            z_report_id: None,
        }
    }
}

/// Journal query filter. Empty fields match everything; `from` is inclusive
/// and `to` exclusive, both RFC 3339.
#[derive(Debug, Clone, Default)]
pub struct BillFilter {
    pub table_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub unreported_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodTotal {
    pub count: i64,
    pub amount: Money,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalSummary {
    pub bill_count: i64,
    pub gross: Money,
    pub change_given: Money,
    pub cash: MethodTotal,
    pub card: MethodTotal,
    pub other: MethodTotal,
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Insert a bill on an already-locked connection.
pub fn insert_bill(conn: &Connection, bill: &Bill) -> Result<(), String> {
    if !bill.amount.is_positive() {
        return Err("Amount must be positive".into());
    }
    let items_json =
        serde_json::to_string(&bill.items).map_err(|e| format!("serialize bill items: {e}"))?;

    conn.execute(
        "INSERT INTO bills (
            id, table_id, amount_cents, tendered_cents, change_cents,
            method, kind, items, created_at, z_report_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            bill.id,
            bill.table_id,
            bill.amount.cents(),
            bill.tendered.cents(),
            bill.change.cents(),
            bill.method.as_str(),
            bill.kind.as_str(),
            items_json,
            bill.created_at,
            bill.z_report_id,
        ],
    )
    .map_err(|e| format!("insert bill: {e}"))?;
    Ok(())
}

/// Record a bill in the ledger.
pub fn add_bill(db: &DbState, bill: &Bill) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    insert_bill(&conn, bill)?;
    info!(
        bill_id = %bill.id,
        table_id = %bill.table_id,
        amount = %bill.amount,
        method = bill.method.as_str(),
        "Bill recorded"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

const BILL_COLUMNS: &str = "id, table_id, amount_cents, tendered_cents, change_cents, \
     method, kind, items, created_at, z_report_id";

fn map_bill_row(row: &rusqlite::Row) -> rusqlite::Result<Bill> {
    let id: String = row.get(0)?;
    let method_raw: String = row.get(5)?;
    let items_json: String = row.get(7)?;
    let method = PaymentMethod::parse(&method_raw).unwrap_or_else(|e| {
        warn!(bill_id = %id, error = %e, "unknown payment method, booking as other");
        PaymentMethod::Other
    });
    let items = serde_json::from_str(&items_json).unwrap_or_else(|e| {
        warn!(bill_id = %id, error = %e, "malformed bill items JSON");
        Vec::new()
    });
    Ok(Bill {
        table_id: row.get(1)?,
        amount: Money::from_cents(row.get(2)?),
        tendered: Money::from_cents(row.get(3)?),
        change: Money::from_cents(row.get(4)?),
        method,
        kind: BillKind::from_db(&row.get::<_, String>(6)?),
        items,
        created_at: row.get(8)?,
        z_report_id: row.get(9)?,
        id,
    })
}

pub fn get_bill(db: &DbState, bill_id: &str) -> Result<Option<Bill>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.query_row(
        &format!("SELECT {BILL_COLUMNS} FROM bills WHERE id = ?1"),
        params![bill_id],
        map_bill_row,
    )
    .optional()
    .map_err(|e| format!("query bill: {e}"))
}

fn where_clause(filter: &BillFilter) -> (String, Vec<&dyn ToSql>) {
    let mut clauses = Vec::new();
    let mut values: Vec<&dyn ToSql> = Vec::new();

    if let Some(table_id) = &filter.table_id {
        values.push(table_id);
        clauses.push(format!("table_id = ?{}", values.len()));
    }
    if let Some(from) = &filter.from {
        values.push(from);
        clauses.push(format!("created_at >= ?{}", values.len()));
    }
    if let Some(to) = &filter.to {
        values.push(to);
        clauses.push(format!("created_at < ?{}", values.len()));
    }
    if filter.unreported_only {
        clauses.push("z_report_id IS NULL".to_string());
    }

    let sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    (sql, values)
}

/// Bills matching `filter`, oldest first.
pub fn list_bills_conn(conn: &Connection, filter: &BillFilter) -> Result<Vec<Bill>, String> {
    let (where_sql, values) = where_clause(filter);
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {BILL_COLUMNS} FROM bills{where_sql} ORDER BY created_at ASC, rowid ASC"
        ))
        .map_err(|e| format!("prepare bills: {e}"))?;

    let rows = stmt
        .query_map(values.as_slice(), map_bill_row)
        .map_err(|e| format!("query bills: {e}"))?;

    let mut bills = Vec::new();
    for row in rows {
        match row {
            Ok(b) => bills.push(b),
            Err(e) => warn!("skipping malformed bill row: {e}"),
        }
    }
    Ok(bills)
}

pub fn list_bills(db: &DbState, filter: &BillFilter) -> Result<Vec<Bill>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    list_bills_conn(&conn, filter)
}

/// Aggregate the bills matching `filter` by payment method.
pub fn journal_totals_conn(conn: &Connection, filter: &BillFilter) -> Result<JournalSummary, String> {
    let (where_sql, values) = where_clause(filter);
    let mut stmt = conn
        .prepare(&format!(
            "SELECT method, COUNT(*), COALESCE(SUM(amount_cents), 0), COALESCE(SUM(change_cents), 0)
             FROM bills{where_sql}
             GROUP BY method"
        ))
        .map_err(|e| format!("prepare journal totals: {e}"))?;

    let rows = stmt
        .query_map(values.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })
        .map_err(|e| format!("query journal totals: {e}"))?;

    let mut summary = JournalSummary::default();
    for (method, count, amount_cents, change_cents) in rows.flatten() {
        let amount = Money::from_cents(amount_cents);
        summary.bill_count += count;
        summary.gross += amount;
        summary.change_given += Money::from_cents(change_cents);

        let bucket = match PaymentMethod::parse(&method) {
            Ok(PaymentMethod::Cash) => &mut summary.cash,
            Ok(PaymentMethod::Card) => &mut summary.card,
            _ => &mut summary.other,
        };
        bucket.count += count;
        bucket.amount += amount;
    }
    Ok(summary)
}

pub fn journal_totals(db: &DbState, filter: &BillFilter) -> Result<JournalSummary, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    journal_totals_conn(&conn, filter)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn cents(c: i64) -> Money {
        Money::from_cents(c)
    }

    fn bill_at(table: &str, amount: i64, method: PaymentMethod, created_at: &str) -> Bill {
        let mut bill = Bill::new(
            table,
            cents(amount),
            cents(amount),
            method,
            BillKind::Partial,
            vec![LineItem::new("a", "Soup", cents(amount), 1)],
        );
        bill.created_at = created_at.to_string();
        bill
    }

    #[test]
    fn test_parse_method() {
        assert_eq!(PaymentMethod::parse("Cash").unwrap(), PaymentMethod::Cash);
        assert_eq!(PaymentMethod::parse(" card ").unwrap(), PaymentMethod::Card);
        assert!(PaymentMethod::parse("bitcoin").is_err());
    }

    #[test]
    fn test_change_is_computed_from_tender() {
        let bill = Bill::new("t1", cents(1850), cents(2000), PaymentMethod::Cash, BillKind::Full, vec![]);
        assert_eq!(bill.change, cents(150));

        let exact = Bill::new("t1", cents(1850), cents(1850), PaymentMethod::Card, BillKind::Full, vec![]);
        assert_eq!(exact.change, Money::ZERO);
    }

    #[test]
    fn test_add_and_get_bill() {
        let db = db::open_in_memory().unwrap();
        let bill = bill_at("t1", 1250, PaymentMethod::Card, "2026-03-01T12:00:00+00:00");
        add_bill(&db, &bill).expect("add_bill");

        let loaded = get_bill(&db, &bill.id).unwrap().expect("bill exists");
        assert_eq!(loaded, bill);
        assert!(get_bill(&db, "missing").unwrap().is_none());
    }

    #[test]
    fn test_add_bill_rejects_non_positive_amount() {
        let db = db::open_in_memory().unwrap();
        let bill = bill_at("t1", 0, PaymentMethod::Cash, "2026-03-01T12:00:00+00:00");
        assert!(add_bill(&db, &bill).is_err());
    }

    #[test]
    fn test_list_bills_filters() {
        let db = db::open_in_memory().unwrap();
        add_bill(&db, &bill_at("t1", 1000, PaymentMethod::Cash, "2026-03-01T10:00:00+00:00")).unwrap();
        add_bill(&db, &bill_at("t2", 2000, PaymentMethod::Card, "2026-03-01T11:00:00+00:00")).unwrap();
        add_bill(&db, &bill_at("t1", 3000, PaymentMethod::Card, "2026-03-02T09:00:00+00:00")).unwrap();

        let all = list_bills(&db, &BillFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].amount, cents(1000));

        let t1 = list_bills(
            &db,
            &BillFilter {
                table_id: Some("t1".into()),
                ..BillFilter::default()
            },
        )
        .unwrap();
        assert_eq!(t1.len(), 2);

        let day_one = list_bills(
            &db,
            &BillFilter {
                from: Some("2026-03-01T00:00:00+00:00".into()),
                to: Some("2026-03-02T00:00:00+00:00".into()),
                ..BillFilter::default()
            },
        )
        .unwrap();
        assert_eq!(day_one.len(), 2);
    }

    #[test]
    fn test_journal_totals_by_method() {
        let db = db::open_in_memory().unwrap();
        let mut cash = bill_at("t1", 1850, PaymentMethod::Cash, "2026-03-01T10:00:00+00:00");
        cash.tendered = cents(2000);
        cash.change = cents(150);
        add_bill(&db, &cash).unwrap();
        add_bill(&db, &bill_at("t2", 2000, PaymentMethod::Card, "2026-03-01T11:00:00+00:00")).unwrap();
        add_bill(&db, &bill_at("t2", 500, PaymentMethod::Other, "2026-03-01T12:00:00+00:00")).unwrap();

        let summary = journal_totals(&db, &BillFilter::default()).unwrap();
        assert_eq!(summary.bill_count, 3);
        assert_eq!(summary.gross, cents(4350));
        assert_eq!(summary.change_given, cents(150));
        assert_eq!(summary.cash, MethodTotal { count: 1, amount: cents(1850) });
        assert_eq!(summary.card, MethodTotal { count: 1, amount: cents(2000) });
        assert_eq!(summary.other, MethodTotal { count: 1, amount: cents(500) });
    }
}
