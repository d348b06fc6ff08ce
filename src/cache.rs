//! Bounded read-through cache of table records.
//!
//! Owned by the application context and passed by reference to whatever
//! needs table reads. Entries expire after the configured TTL; once the
//! capacity is reached the oldest insertion is evicted.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::tables::Table;

struct Entry {
    table: Table,
    stored_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    insertion_order: VecDeque<String>,
}

impl Inner {
    fn forget(&mut self, table_id: &str) -> bool {
        let removed = self.entries.remove(table_id).is_some();
        if removed {
            self.insertion_order.retain(|id| id != table_id);
        }
        removed
    }
}

pub struct TableCache {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl TableCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Fresh cached copy of a table, if any.
    pub fn get(&self, table_id: &str) -> Option<Table> {
        let mut inner = self.lock()?;
        let expired = match inner.entries.get(table_id) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                return Some(entry.table.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.forget(table_id);
        }
        None
    }

    pub fn put(&self, table: Table) {
        let Some(mut inner) = self.lock() else {
            return;
        };
        inner.forget(&table.id);
        while inner.entries.len() >= self.capacity {
            let Some(oldest) = inner.insertion_order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
            debug!(table_id = %oldest, "Table cache eviction");
        }
        inner.insertion_order.push_back(table.id.clone());
        inner.entries.insert(
            table.id.clone(),
            Entry {
                table,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, table_id: &str) {
        if let Some(mut inner) = self.lock() {
            inner.forget(table_id);
        }
    }

    pub fn clear(&self) {
        if let Some(mut inner) = self.lock() {
            inner.entries.clear();
            inner.insertion_order.clear();
        }
    }

    /// Drop every expired entry. Returns how many were removed; meant to be
    /// called periodically by the owner.
    pub fn clear_expired(&self) -> usize {
        let Some(mut inner) = self.lock() else {
            return 0;
        };
        let ttl = self.ttl;
        let stale: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.stored_at.elapsed() >= ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            inner.forget(id);
        }
        if !stale.is_empty() {
            debug!(removed = stale.len(), "Table cache expired entries cleared");
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Option<std::sync::MutexGuard<'_, Inner>> {
        match self.inner.lock() {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!("table cache lock poisoned: {e}");
                None
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
