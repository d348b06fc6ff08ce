//! Dining table and open-order repository.
//!
//! Each table row carries at most one open order: its line items as a JSON
//! array plus the cached total in cents. The total is recomputed from the
//! items on every write, never updated on its own.

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::money::Money;
use crate::settlement::{recompute_total, LineItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableStatus {
    Available,
    Occupied,
}

impl TableStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TableStatus::Available => "available",
            TableStatus::Occupied => "occupied",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw {
            "occupied" => TableStatus::Occupied,
            _ => TableStatus::Available,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: String,
    pub label: String,
    pub seats: u32,
    pub guests: u32,
    pub status: TableStatus,
    pub items: Vec<LineItem>,
    pub total: Money,
    pub opened_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Table {
    /// Replace the order's items, dropping empty lines and recomputing the
    /// total.
    pub fn set_items(&mut self, items: Vec<LineItem>) {
        self.items = items.into_iter().filter(|i| i.quantity > 0).collect();
        self.total = recompute_total(&self.items);
    }

    /// True while anything of an order (items or seated guests) remains.
    pub fn has_open_order(&self) -> bool {
        !self.items.is_empty() || self.guests > 0
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers (usable inside a caller's transaction)
// ---------------------------------------------------------------------------

fn map_table_row(row: &rusqlite::Row) -> rusqlite::Result<Table> {
    let id: String = row.get(0)?;
    let items_json: String = row.get(5)?;
    // A row whose order cannot be read must not load as empty, or the next
    // write would replace the stored order with nothing.
    let items: Vec<LineItem> = serde_json::from_str(&items_json).map_err(|e| {
        warn!(table_id = %id, error = %e, "malformed items JSON");
        rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
    })?;
    Ok(Table {
        label: row.get(1)?,
        seats: row.get(2)?,
        guests: row.get(3)?,
        status: TableStatus::from_db(&row.get::<_, String>(4)?),
        items,
        total: Money::from_cents(row.get(6)?),
        opened_at: row.get(7)?,
        updated_at: row.get(8)?,
        id,
    })
}

const TABLE_COLUMNS: &str =
    "id, label, seats, guests, status, items, total_cents, opened_at, updated_at";

/// Load one table, `None` when the id is unknown.
pub fn load_table(conn: &Connection, table_id: &str) -> Result<Option<Table>, String> {
    conn.query_row(
        &format!("SELECT {TABLE_COLUMNS} FROM restaurant_tables WHERE id = ?1"),
        params![table_id],
        map_table_row,
    )
    .optional()
    .map_err(|e| format!("query table: {e}"))
}

/// Write a table's order state back. The stored total is always derived
/// from `table.items`.
pub fn store_table(conn: &Connection, table: &Table) -> Result<(), String> {
    let items: Vec<LineItem> = table.items.iter().filter(|i| i.quantity > 0).cloned().collect();
    if let Some(bad) = items.iter().find(|i| i.unit_price < Money::ZERO) {
        return Err(format!("Negative price for {}", bad.name));
    }
    let total = recompute_total(&items);
    let items_json =
        serde_json::to_string(&items).map_err(|e| format!("serialize items: {e}"))?;
    let now = Utc::now().to_rfc3339();

    let changed = conn
        .execute(
            "UPDATE restaurant_tables SET
                label = ?1,
                seats = ?2,
                guests = ?3,
                status = ?4,
                items = ?5,
                total_cents = ?6,
                opened_at = ?7,
                updated_at = ?8
             WHERE id = ?9",
            params![
                table.label,
                table.seats,
                table.guests,
                table.status.as_str(),
                items_json,
                total.cents(),
                table.opened_at,
                now,
                table.id,
            ],
        )
        .map_err(|e| format!("update table: {e}"))?;

    if changed == 0 {
        return Err(format!("Table not found: {}", table.id));
    }
    Ok(())
}

/// Clear a table back to an empty, available state.
pub fn clear_table(conn: &Connection, table_id: &str) -> Result<(), String> {
    let now = Utc::now().to_rfc3339();
    let changed = conn
        .execute(
            "UPDATE restaurant_tables SET
                guests = 0,
                status = 'available',
                items = '[]',
                total_cents = 0,
                opened_at = NULL,
                updated_at = ?1
             WHERE id = ?2",
            params![now, table_id],
        )
        .map_err(|e| format!("reset table: {e}"))?;

    if changed == 0 {
        return Err(format!("Table not found: {table_id}"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Repository operations
// ---------------------------------------------------------------------------

fn reload(conn: &Connection, table_id: &str) -> Result<Table, String> {
    load_table(conn, table_id)?.ok_or_else(|| format!("Table not found: {table_id}"))
}

/// Register a new dining table.
pub fn create_table_conn(conn: &Connection, table_id: &str, label: &str, seats: u32) -> Result<Table, String> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO restaurant_tables (id, label, seats, status, items, total_cents, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'available', '[]', 0, ?4, ?4)",
        params![table_id, label, seats, now],
    )
    .map_err(|e| format!("insert table: {e}"))?;

    info!(table_id = %table_id, label = %label, seats, "Table created");
    reload(conn, table_id)
}

pub fn create_table(db: &DbState, table_id: &str, label: &str, seats: u32) -> Result<Table, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    create_table_conn(&conn, table_id, label, seats)
}

pub fn get_table(db: &DbState, table_id: &str) -> Result<Table, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    reload(&conn, table_id)
}

/// All tables ordered by label.
pub fn list_tables(db: &DbState) -> Result<Vec<Table>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    list_tables_conn(&conn)
}

pub fn list_tables_conn(conn: &Connection) -> Result<Vec<Table>, String> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {TABLE_COLUMNS} FROM restaurant_tables ORDER BY label ASC"
        ))
        .map_err(|e| e.to_string())?;

    let rows = stmt.query_map([], map_table_row).map_err(|e| e.to_string())?;

    let mut tables = Vec::new();
    for row in rows {
        match row {
            Ok(t) => tables.push(t),
            Err(e) => warn!("skipping malformed table row: {e}"),
        }
    }
    Ok(tables)
}

pub fn update_table_conn(conn: &Connection, table: &Table) -> Result<Table, String> {
    store_table(conn, table)?;
    reload(conn, &table.id)
}

pub fn update_table(db: &DbState, table: &Table) -> Result<Table, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    update_table_conn(&conn, table)
}

pub fn reset_table_conn(conn: &Connection, table_id: &str) -> Result<Table, String> {
    clear_table(conn, table_id)?;
    info!(table_id = %table_id, "Table reset");
    reload(conn, table_id)
}

pub fn reset_table(db: &DbState, table_id: &str) -> Result<Table, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    reset_table_conn(&conn, table_id)
}

/// Seat guests at a table and mark it occupied.
pub fn open_table_conn(conn: &Connection, table_id: &str, guests: u32) -> Result<Table, String> {
    if guests == 0 {
        return Err("Guest count must be at least 1".into());
    }
    let mut table = reload(conn, table_id)?;

    table.guests = guests;
    table.status = TableStatus::Occupied;
    if table.opened_at.is_none() {
        table.opened_at = Some(Utc::now().to_rfc3339());
    }
    store_table(conn, &table)?;

    info!(table_id = %table_id, guests, "Table opened");
    reload(conn, table_id)
}

pub fn open_table(db: &DbState, table_id: &str, guests: u32) -> Result<Table, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    open_table_conn(&conn, table_id, guests)
}

/// Add ordered items to a table's open order.
///
/// Lines matching an existing line by name and unit price are merged into
/// it; synthetic remainder lines are never merged.
pub fn add_items_conn(conn: &Connection, table_id: &str, new_items: Vec<LineItem>) -> Result<Table, String> {
    let mut table = reload(conn, table_id)?;

    let mut items = table.items.clone();
    for mut incoming in new_items.into_iter().filter(|i| i.quantity > 0) {
        if incoming.unit_price < Money::ZERO {
            return Err(format!("Negative price for {}", incoming.name));
        }
        let existing = items.iter_mut().find(|i| {
            !i.is_remainder()
                && !incoming.is_remainder()
                && i.name == incoming.name
                && i.unit_price == incoming.unit_price
        });
        match existing {
            Some(line) => line.quantity = line.quantity.saturating_add(incoming.quantity),
            None => {
                if incoming.id.trim().is_empty() {
                    incoming.id = Uuid::new_v4().to_string();
                }
                items.push(incoming);
            }
        }
    }

    table.set_items(items);
    if table.opened_at.is_none() {
        table.opened_at = Some(Utc::now().to_rfc3339());
    }
    table.status = TableStatus::Occupied;
    store_table(conn, &table)?;

    info!(table_id = %table_id, total = %table.total, lines = table.items.len(), "Items added to table");
    reload(conn, table_id)
}

pub fn add_items(db: &DbState, table_id: &str, new_items: Vec<LineItem>) -> Result<Table, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    add_items_conn(&conn, table_id, new_items)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_db() -> DbState {
        let db = db::open_in_memory().expect("open in-memory db");
        create_table(&db, "t1", "Table 1", 4).expect("create t1");
        db
    }

    fn cents(c: i64) -> Money {
        Money::from_cents(c)
    }

    #[test]
    fn test_create_and_get_table() {
        let db = test_db();
        let table = get_table(&db, "t1").expect("get");
        assert_eq!(table.label, "Table 1");
        assert_eq!(table.status, TableStatus::Available);
        assert!(table.items.is_empty());
        assert_eq!(table.total, Money::ZERO);

        let err = get_table(&db, "missing").unwrap_err();
        assert!(err.contains("Table not found"));
    }

    #[test]
    fn test_list_tables_sorted_by_label() {
        let db = test_db();
        create_table(&db, "t0", "Patio", 2).unwrap();
        let labels: Vec<String> = list_tables(&db).unwrap().into_iter().map(|t| t.label).collect();
        assert_eq!(labels, vec!["Patio".to_string(), "Table 1".to_string()]);
    }

    #[test]
    fn test_add_items_merges_and_recomputes_total() {
        let db = test_db();
        open_table(&db, "t1", 2).expect("open");

        add_items(
            &db,
            "t1",
            vec![
                LineItem::new("", "Margherita", cents(900), 1),
                LineItem::new("", "Water", cents(250), 2),
            ],
        )
        .expect("add");
        let table = add_items(&db, "t1", vec![LineItem::new("", "Margherita", cents(900), 2)])
            .expect("add again");

        assert_eq!(table.items.len(), 2);
        let pizza = table.items.iter().find(|i| i.name == "Margherita").unwrap();
        assert_eq!(pizza.quantity, 3);
        assert!(!pizza.id.is_empty());
        assert_eq!(table.total, cents(3200));
        assert_eq!(table.status, TableStatus::Occupied);
        assert_eq!(table.guests, 2);
    }

    #[test]
    fn test_add_items_rejects_negative_price() {
        let db = test_db();
        let err = add_items(&db, "t1", vec![LineItem::new("x", "Voucher", cents(-100), 1)])
            .unwrap_err();
        assert!(err.contains("Negative price"));
        assert!(get_table(&db, "t1").unwrap().items.is_empty());
    }

    #[test]
    fn test_update_table_derives_total_from_items() {
        let db = test_db();
        let mut table = get_table(&db, "t1").unwrap();
        table.items = vec![
            LineItem::new("a", "Soup", cents(550), 2),
            LineItem::new("b", "Gone", cents(100), 0),
        ];
        table.total = cents(1);

        let stored = update_table(&db, &table).expect("update");
        assert_eq!(stored.items.len(), 1);
        assert_eq!(stored.total, cents(1100));
    }

    #[test]
    fn test_reset_table_clears_order_and_guests() {
        let db = test_db();
        open_table(&db, "t1", 3).unwrap();
        add_items(&db, "t1", vec![LineItem::new("a", "Soup", cents(550), 1)]).unwrap();

        let table = reset_table(&db, "t1").expect("reset");
        assert!(!table.has_open_order());
        assert_eq!(table.status, TableStatus::Available);
        assert_eq!(table.total, Money::ZERO);
        assert!(table.opened_at.is_none());
    }

    #[test]
    fn test_update_table_rejects_negative_price() {
        let db = test_db();
        let mut table = get_table(&db, "t1").unwrap();
        table.items = vec![LineItem::new("v", "Voucher", cents(-500), 1)];
        assert!(update_table(&db, &table).unwrap_err().contains("Negative price"));
        assert!(get_table(&db, "t1").unwrap().items.is_empty());
    }

    #[test]
    fn test_malformed_items_are_not_overwritten() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE restaurant_tables SET items = '[{\"broken\"' WHERE id = 't1'",
                [],
            )
            .unwrap();
        }

        assert!(get_table(&db, "t1").is_err());
        assert!(open_table(&db, "t1", 2).is_err());
        assert!(list_tables(&db).unwrap().is_empty());

        let conn = db.conn.lock().unwrap();
        let raw: String = conn
            .query_row("SELECT items FROM restaurant_tables WHERE id = 't1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(raw, "[{\"broken\"");
    }

    #[test]
    fn test_open_table_requires_guests() {
        let db = test_db();
        assert!(open_table(&db, "t1", 0).is_err());
        assert!(open_table(&db, "nope", 2).is_err());
    }
}
