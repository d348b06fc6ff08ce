//! Table POS core.
//!
//! Table management, order entry against a menu, partial and split payments,
//! the bill ledger (sales journal) and the end-of-day Z report, on top of a
//! local SQLite database. `AppContext` is the composition root: it owns the
//! database handle, the table cache and the table event fan-out, and every
//! screen-level operation goes through it.

use rusqlite::Connection;
use tracing::info;

pub mod bills;
pub mod cache;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod events;
pub mod menu;
pub mod money;
pub mod payments;
pub mod settlement;
pub mod tables;
pub mod zreport;

pub use bills::{Bill, BillFilter, BillKind, JournalSummary, PaymentMethod};
pub use cache::TableCache;
pub use config::PosConfig;
pub use db::DbState;
pub use events::{Subscription, TableEvent, TableEvents};
pub use money::{Money, MoneyError};
pub use payments::{ItemSelection, PaymentError, PaymentReceipt, PendingWriteBack};
pub use settlement::{recompute_total, settle, LineItem, SettlementError, SettlementResult};
pub use tables::{Table, TableStatus};

/// Long-lived application state shared by all screens.
pub struct AppContext {
    pub db: DbState,
    pub cache: TableCache,
    pub events: TableEvents,
    pub config: PosConfig,
}

impl AppContext {
    /// Open the on-disk database under `config.data_dir` and apply stored
    /// operator settings.
    pub fn open(mut config: PosConfig) -> Result<Self, String> {
        let db = db::init(&config.data_dir)?;
        config.apply_stored_settings(&db)?;
        info!(
            data_dir = %config.data_dir.display(),
            currency = %config.currency,
            "Starting table POS v{}",
            env!("CARGO_PKG_VERSION")
        );
        Ok(Self::with_state(db, config))
    }

    /// Context backed by a throwaway in-memory database.
    pub fn in_memory(config: PosConfig) -> Result<Self, String> {
        Ok(Self::with_state(db::open_in_memory()?, config))
    }

    pub fn with_state(db: DbState, config: PosConfig) -> Self {
        Self {
            cache: TableCache::new(config.cache_capacity, config.cache_ttl()),
            events: TableEvents::new(),
            db,
            config,
        }
    }

    // -----------------------------------------------------------------------
    // Tables
    // -----------------------------------------------------------------------

    /// Read a table, served from the cache while fresh.
    pub fn table(&self, table_id: &str) -> Result<Table, String> {
        if let Some(table) = self.cache.get(table_id) {
            return Ok(table);
        }
        self.with_table_write(|conn| {
            tables::load_table(conn, table_id)?
                .ok_or_else(|| format!("Table not found: {table_id}"))
        })
    }

    pub fn tables(&self) -> Result<Vec<Table>, String> {
        tables::list_tables(&self.db)
    }

    pub fn create_table(&self, table_id: &str, label: &str, seats: u32) -> Result<Table, String> {
        let table = self.with_table_write(|conn| tables::create_table_conn(conn, table_id, label, seats))?;
        self.table_changed(&table);
        Ok(table)
    }

    pub fn open_table(&self, table_id: &str, guests: u32) -> Result<Table, String> {
        let table = self.with_table_write(|conn| tables::open_table_conn(conn, table_id, guests))?;
        self.table_changed(&table);
        Ok(table)
    }

    /// Order `quantity` units of each menu item onto a table.
    pub fn order_from_menu(&self, table_id: &str, lines: &[(&str, u32)]) -> Result<Table, String> {
        let items = lines
            .iter()
            .map(|(item_id, quantity)| menu::order_line(&self.db, item_id, *quantity))
            .collect::<Result<Vec<_>, _>>()?;
        self.add_items(table_id, items)
    }

    pub fn add_items(&self, table_id: &str, items: Vec<LineItem>) -> Result<Table, String> {
        let table = self.with_table_write(|conn| tables::add_items_conn(conn, table_id, items))?;
        self.table_changed(&table);
        Ok(table)
    }

    pub fn update_table(&self, table: &Table) -> Result<Table, String> {
        let stored = self.with_table_write(|conn| tables::update_table_conn(conn, table))?;
        self.table_changed(&stored);
        Ok(stored)
    }

    pub fn reset_table(&self, table_id: &str) -> Result<Table, String> {
        let table = self.with_table_write(|conn| tables::reset_table_conn(conn, table_id))?;
        self.events.notify(TableEvent::Reset {
            table_id: table_id.to_string(),
        });
        Ok(table)
    }

    /// Periodic housekeeping: drops expired cache entries.
    pub fn maintain(&self) -> usize {
        self.cache.clear_expired()
    }

    /// Run `op` under the connection lock and cache its result before the
    /// lock is released, so cache updates land in database write order.
    fn with_table_write<F>(&self, op: F) -> Result<Table, String>
    where
        F: FnOnce(&Connection) -> Result<Table, String>,
    {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        let table = op(&conn)?;
        self.cache.put(table.clone());
        Ok(table)
    }

    fn table_changed(&self, table: &Table) {
        self.events.notify(TableEvent::Updated {
            table_id: table.id.clone(),
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn ctx() -> AppContext {
        let ctx = AppContext::in_memory(PosConfig::default()).expect("context");
        ctx.create_table("t1", "Table 1", 4).expect("create");
        ctx
    }

    #[test]
    fn test_table_reads_go_through_cache() {
        let ctx = ctx();
        ctx.cache.clear();

        let first = ctx.table("t1").unwrap();
        assert_eq!(ctx.cache.len(), 1);

        // A write that bypasses the context is invisible until invalidated.
        let mut changed = first.clone();
        changed.label = "Window".into();
        tables::update_table(&ctx.db, &changed).unwrap();
        assert_eq!(ctx.table("t1").unwrap().label, "Table 1");

        ctx.cache.invalidate("t1");
        assert_eq!(ctx.table("t1").unwrap().label, "Window");
    }

    #[test]
    fn test_mutations_notify_subscribers() {
        let ctx = ctx();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = ctx.events.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

        ctx.open_table("t1", 2).unwrap();
        ctx.reset_table("t1").unwrap();
        sub.unsubscribe();
        ctx.open_table("t1", 2).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], TableEvent::Updated { .. }));
        assert!(matches!(seen[1], TableEvent::Reset { .. }));
    }

    #[test]
    fn test_cache_matches_database_after_concurrent_writes() {
        let ctx = std::sync::Arc::new(ctx());
        ctx.open_table("t1", 2).unwrap();

        let orders = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                for _ in 0..40 {
                    ctx.add_items("t1", vec![LineItem::new("", "Espresso", Money::from_cents(250), 1)])
                        .unwrap();
                }
            })
        };
        let payments = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                for _ in 0..40 {
                    // The order may be empty at this moment.
                    let _ = payments::pay_full(&ctx, "t1", PaymentMethod::Cash, None);
                    let _ = ctx.table("t1");
                }
            })
        };
        orders.join().unwrap();
        payments.join().unwrap();

        let cached = ctx.cache.get("t1").expect("cached");
        assert_eq!(cached, tables::get_table(&ctx.db, "t1").unwrap());
    }

    #[test]
    fn test_maintain_drops_expired_entries() {
        let config = PosConfig {
            cache_ttl_secs: 0,
            ..PosConfig::default()
        };
        let ctx = AppContext::in_memory(config).unwrap();
        ctx.create_table("t1", "Table 1", 4).unwrap();
        ctx.create_table("t2", "Table 2", 4).unwrap();
        assert_eq!(ctx.cache.len(), 2);

        assert_eq!(ctx.maintain(), 2);
        assert!(ctx.cache.is_empty());
        // Reads still work and repopulate the cache.
        assert_eq!(ctx.table("t2").unwrap().label, "Table 2");
        assert_eq!(ctx.cache.len(), 1);
    }

    #[test]
    fn test_order_from_menu() {
        let ctx = ctx();
        menu::save_menu(
            &ctx.db,
            &[menu::MenuItem {
                id: "m1".into(),
                name: "Risotto".into(),
                price: Money::from_cents(1400),
                category: None,
            }],
        )
        .unwrap();

        let table = ctx.order_from_menu("t1", &[("m1", 2)]).unwrap();
        assert_eq!(table.total, Money::from_cents(2800));
        assert_eq!(ctx.table("t1").unwrap().total, Money::from_cents(2800));

        assert!(ctx.order_from_menu("t1", &[("missing", 1)]).is_err());
    }
}
