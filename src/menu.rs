//! Menu, item availability and keyword categorization.
//!
//! The menu and the availability map both live in the JSON key-value store.
//! Items without an explicit category are sorted into one by an ordered rule
//! table: the first rule with a keyword contained in the item name wins.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::money::Money;
use crate::settlement::LineItem;

const MENU_KEY: &str = "menu_items";
const AVAILABILITY_KEY: &str = "menu_availability";
const CATEGORY_RULES_KEY: &str = "category_rules";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    pub id: String,
    pub name: String,
    pub price: Money,
    #[serde(default)]
    pub category: Option<String>,
}

// ---------------------------------------------------------------------------
// Category rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub category: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRules {
    pub rules: Vec<CategoryRule>,
    pub fallback: String,
}

impl Default for CategoryRules {
    fn default() -> Self {
        let rule = |category: &str, keywords: &[&str]| CategoryRule {
            category: category.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        };
        Self {
            rules: vec![
                rule("Drinks", &["water", "cola", "juice", "beer", "wine", "coffee", "espresso", "tea", "soda", "spritz"]),
                rule("Desserts", &["tiramisu", "cake", "gelato", "ice cream", "panna cotta", "sorbet", "pie"]),
                rule("Starters", &["soup", "salad", "bruschetta", "antipast", "carpaccio", "fries"]),
                rule("Mains", &["pizza", "pasta", "risotto", "steak", "burger", "fish", "chicken", "lasagna"]),
            ],
            fallback: "Other".to_string(),
        }
    }
}

impl CategoryRules {
    /// Category for an item name. Matching is case-insensitive substring
    /// search, rules are tried in order.
    pub fn categorize(&self, name: &str) -> &str {
        let lowered = name.to_lowercase();
        self.rules
            .iter()
            .find(|rule| {
                rule.keywords
                    .iter()
                    .any(|k| !k.is_empty() && lowered.contains(&k.to_lowercase()))
            })
            .map(|rule| rule.category.as_str())
            .unwrap_or(self.fallback.as_str())
    }

    /// Category of a menu item: its explicit category if set, otherwise the
    /// rule-derived one.
    pub fn category_of<'a>(&'a self, item: &'a MenuItem) -> &'a str {
        match item.category.as_deref().map(str::trim) {
            Some(explicit) if !explicit.is_empty() => explicit,
            _ => self.categorize(&item.name),
        }
    }

    /// Group items by category in rule order; the fallback group and any
    /// explicit categories unknown to the rules come last.
    pub fn group<'a>(&'a self, items: &'a [MenuItem]) -> Vec<(String, Vec<&'a MenuItem>)> {
        let mut groups: Vec<(String, Vec<&MenuItem>)> = self
            .rules
            .iter()
            .map(|r| (r.category.clone(), Vec::new()))
            .collect();

        for item in items {
            let category = self.category_of(item);
            match groups.iter_mut().find(|(name, _)| name == category) {
                Some((_, members)) => members.push(item),
                None => groups.push((category.to_string(), vec![item])),
            }
        }

        groups.retain(|(_, members)| !members.is_empty());
        let fallback = self.fallback.as_str();
        groups.sort_by_key(|(name, _)| name == fallback);
        groups
    }
}

/// Rules stored in the key-value store, or the defaults.
pub fn load_category_rules(db: &DbState) -> Result<CategoryRules, String> {
    let raw = db::kv_get(db, CATEGORY_RULES_KEY)?;
    if raw.is_null() {
        return Ok(CategoryRules::default());
    }
    serde_json::from_value(raw).or_else(|e| {
        warn!(error = %e, "stored category rules are invalid, using defaults");
        Ok(CategoryRules::default())
    })
}

pub fn save_category_rules(db: &DbState, rules: &CategoryRules) -> Result<(), String> {
    let value = serde_json::to_value(rules).map_err(|e| format!("serialize rules: {e}"))?;
    db::kv_set(db, CATEGORY_RULES_KEY, &value)
}

// ---------------------------------------------------------------------------
// Menu and availability
// ---------------------------------------------------------------------------

/// Read the stored menu. Returns an empty list on miss.
pub fn load_menu(db: &DbState) -> Result<Vec<MenuItem>, String> {
    match db::kv_get(db, MENU_KEY)? {
        Value::Null => Ok(Vec::new()),
        Value::Array(entries) => {
            let mut items = Vec::with_capacity(entries.len());
            for entry in entries {
                match serde_json::from_value::<MenuItem>(entry) {
                    Ok(item) => items.push(item),
                    Err(e) => warn!("skipping malformed menu entry: {e}"),
                }
            }
            Ok(items)
        }
        other => {
            warn!("menu is not an array ({}), ignoring", other);
            Ok(Vec::new())
        }
    }
}

pub fn save_menu(db: &DbState, items: &[MenuItem]) -> Result<(), String> {
    let value = serde_json::to_value(items).map_err(|e| format!("serialize menu: {e}"))?;
    db::kv_set(db, MENU_KEY, &value)?;
    info!(items = items.len(), "Menu saved");
    Ok(())
}

/// Stored availability flags keyed by menu item id.
pub fn availability(db: &DbState) -> Result<HashMap<String, bool>, String> {
    let raw = db::kv_get(db, AVAILABILITY_KEY)?;
    let map: HashMap<String, bool> = raw
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(id, v)| v.as_bool().map(|b| (id.clone(), b)))
                .collect()
        })
        .unwrap_or_default();
    Ok(map)
}

pub fn set_availability(db: &DbState, item_id: &str, available: bool) -> Result<(), String> {
    let mut map = availability(db)?;
    map.insert(item_id.to_string(), available);
    let value = serde_json::to_value(&map).map_err(|e| format!("serialize availability: {e}"))?;
    db::kv_set(db, AVAILABILITY_KEY, &value)?;
    info!(item_id = %item_id, available, "Menu availability changed");
    Ok(())
}

/// Items with no stored flag count as available.
pub fn is_available(db: &DbState, item_id: &str) -> Result<bool, String> {
    Ok(availability(db)?.get(item_id).copied().unwrap_or(true))
}

pub fn available_items(db: &DbState) -> Result<Vec<MenuItem>, String> {
    let flags = availability(db)?;
    Ok(load_menu(db)?
        .into_iter()
        .filter(|item| flags.get(&item.id).copied().unwrap_or(true))
        .collect())
}

/// Build an order line for `quantity` units of a menu item.
pub fn order_line(db: &DbState, item_id: &str, quantity: u32) -> Result<LineItem, String> {
    if quantity == 0 {
        return Err("Quantity must be at least 1".into());
    }
    let item = load_menu(db)?
        .into_iter()
        .find(|i| i.id == item_id)
        .ok_or_else(|| format!("Menu item not found: {item_id}"))?;
    if !is_available(db, item_id)? {
        return Err(format!("Menu item unavailable: {}", item.name));
    }
    Ok(LineItem::new(item.id, item.name, item.price, quantity))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn menu_item(id: &str, name: &str, cents: i64) -> MenuItem {
        MenuItem {
            id: id.to_string(),
            name: name.to_string(),
            price: Money::from_cents(cents),
            category: None,
        }
    }

    fn seeded_db() -> DbState {
        let db = db::open_in_memory().unwrap();
        save_menu(
            &db,
            &[
                menu_item("m1", "Margherita Pizza", 900),
                menu_item("m2", "Sparkling Water", 250),
                menu_item("m3", "Tiramisu", 600),
            ],
        )
        .unwrap();
        db
    }

    #[test]
    fn test_categorize_first_match_wins() {
        let rules = CategoryRules::default();
        assert_eq!(rules.categorize("Sparkling WATER"), "Drinks");
        assert_eq!(rules.categorize("Tiramisu"), "Desserts");
        assert_eq!(rules.categorize("Tomato Soup"), "Starters");
        assert_eq!(rules.categorize("Pizza Diavola"), "Mains");
        // "coffee" (Drinks) precedes "cake" (Desserts).
        assert_eq!(rules.categorize("Coffee cake"), "Drinks");
        assert_eq!(rules.categorize("Cover charge"), "Other");
    }

    #[test]
    fn test_explicit_category_beats_rules() {
        let rules = CategoryRules::default();
        let mut item = menu_item("m1", "House wine", 500);
        assert_eq!(rules.category_of(&item), "Drinks");
        item.category = Some("Specials".into());
        assert_eq!(rules.category_of(&item), "Specials");
    }

    #[test]
    fn test_group_orders_by_rules_with_fallback_last() {
        let rules = CategoryRules::default();
        let items = vec![
            menu_item("a", "Bread basket", 300),
            menu_item("b", "Lasagna", 1200),
            menu_item("c", "Espresso", 180),
        ];
        let names: Vec<String> = rules.group(&items).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Drinks", "Mains", "Other"]);
    }

    #[test]
    fn test_custom_rules_roundtrip_through_store() {
        let db = db::open_in_memory().unwrap();
        assert_eq!(load_category_rules(&db).unwrap(), CategoryRules::default());

        let custom = CategoryRules {
            rules: vec![CategoryRule {
                category: "Brunch".into(),
                keywords: vec!["egg".into()],
            }],
            fallback: "Misc".into(),
        };
        save_category_rules(&db, &custom).unwrap();
        let loaded = load_category_rules(&db).unwrap();
        assert_eq!(loaded.categorize("Eggs Benedict"), "Brunch");
        assert_eq!(loaded.categorize("Toast"), "Misc");
    }

    #[test]
    fn test_availability_filters_menu() {
        let db = seeded_db();
        assert!(is_available(&db, "m2").unwrap());

        set_availability(&db, "m2", false).unwrap();
        assert!(!is_available(&db, "m2").unwrap());

        let ids: Vec<String> = available_items(&db).unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["m1".to_string(), "m3".to_string()]);
    }

    #[test]
    fn test_order_line_from_menu() {
        let db = seeded_db();
        let line = order_line(&db, "m1", 2).unwrap();
        assert_eq!(line.name, "Margherita Pizza");
        assert_eq!(line.line_total(), Money::from_cents(1800));

        set_availability(&db, "m3", false).unwrap();
        assert!(order_line(&db, "m3", 1).unwrap_err().contains("unavailable"));
        assert!(order_line(&db, "nope", 1).is_err());
        assert!(order_line(&db, "m1", 0).is_err());
    }
}
