//! Runtime configuration.
//!
//! Defaults, then environment variables, then values an operator stored in
//! `local_settings` under the `terminal` category.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::db::{self, DbState};

pub const DEFAULT_LOG_FILTER: &str = "info,table_pos_lib=debug";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PosConfig {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_filter: String,
    pub max_log_files: usize,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
    pub currency: String,
}

impl Default for PosConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("pos-data");
        Self {
            log_dir: data_dir.join("logs"),
            data_dir,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            max_log_files: 10,
            cache_capacity: 64,
            cache_ttl_secs: 300,
            currency: "EUR".to_string(),
        }
    }
}

impl PosConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let data_dir = lookup("POS_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let log_dir = lookup("POS_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("logs"));

        Self {
            log_filter: lookup("RUST_LOG").unwrap_or(defaults.log_filter),
            max_log_files: parse_or(&lookup, "POS_MAX_LOG_FILES", defaults.max_log_files),
            cache_capacity: parse_or(&lookup, "POS_CACHE_CAPACITY", defaults.cache_capacity),
            cache_ttl_secs: parse_or(&lookup, "POS_CACHE_TTL_SECS", defaults.cache_ttl_secs),
            currency: lookup("POS_CURRENCY").unwrap_or(defaults.currency),
            data_dir,
            log_dir,
        }
    }

    /// Overlay operator settings stored in the database.
    pub fn apply_stored_settings(&mut self, db: &DbState) -> Result<(), String> {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        if let Some(currency) = db::get_setting(&conn, "terminal", "currency") {
            self.currency = currency;
        }
        if let Some(raw) = db::get_setting(&conn, "terminal", "cache_capacity") {
            match raw.parse() {
                Ok(v) => self.cache_capacity = v,
                Err(_) => warn!(value = %raw, "ignoring invalid stored cache_capacity"),
            }
        }
        if let Some(raw) = db::get_setting(&conn, "terminal", "cache_ttl_secs") {
            match raw.parse() {
                Ok(v) => self.cache_ttl_secs = v,
                Err(_) => warn!(value = %raw, "ignoring invalid stored cache_ttl_secs"),
            }
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring invalid configuration value");
            default
        }),
        None => default,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
