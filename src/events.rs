//! Table change notifications.
//!
//! Screens that show table state subscribe when they mount and drop (or
//! explicitly unsubscribe) their `Subscription` on teardown. Listeners are
//! invoked outside the registry lock, so a listener may subscribe or
//! unsubscribe without deadlocking.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tracing::{debug, error};

use crate::money::Money;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TableEvent {
    /// Order items, guests or status changed.
    Updated { table_id: String },
    /// Table went back to available with no order.
    Reset { table_id: String },
    /// A bill was recorded against the table.
    Paid {
        table_id: String,
        bill_id: String,
        amount: Money,
        new_total: Money,
    },
}

impl TableEvent {
    pub fn table_id(&self) -> &str {
        match self {
            TableEvent::Updated { table_id }
            | TableEvent::Reset { table_id }
            | TableEvent::Paid { table_id, .. } => table_id,
        }
    }
}

type Listener = Arc<dyn Fn(&TableEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: BTreeMap<u64, Listener>,
}

/// Fan-out point for table events, owned by the application context.
#[derive(Default, Clone)]
pub struct TableEvents {
    registry: Arc<Mutex<Registry>>,
}

impl TableEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`. It stays attached until the returned handle is
    /// dropped or `unsubscribe` is called on it.
    #[must_use = "dropping the subscription detaches the listener immediately"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&TableEvent) + Send + Sync + 'static,
    {
        let id = match self.registry.lock() {
            Ok(mut reg) => {
                reg.next_id += 1;
                let id = reg.next_id;
                reg.listeners.insert(id, Arc::new(listener));
                id
            }
            Err(e) => {
                error!("table events registry poisoned: {e}");
                0
            }
        };
        debug!(subscription = id, "Table listener subscribed");
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn notify(&self, event: TableEvent) {
        let listeners: Vec<Listener> = match self.registry.lock() {
            Ok(reg) => reg.listeners.values().cloned().collect(),
            Err(e) => {
                error!("table events registry poisoned: {e}");
                return;
            }
        };
        debug!(table_id = %event.table_id(), listeners = listeners.len(), "Table event");
        for listener in listeners {
            listener(&event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry
            .lock()
            .map(|reg| reg.listeners.len())
            .unwrap_or(0)
    }
}

/// Handle for one registered listener.
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut reg) = registry.lock() {
                reg.listeners.remove(&self.id);
                debug!(subscription = self.id, "Table listener unsubscribed");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
