//! Hot-reloadable config cache (§4.6) plus per-pair threshold resolution.
//!
//! The cache is a flat `"category.key" -> JSON string` map refreshed on
//! every write. Reads attempt `serde_json::from_str`; values written before
//! JSON-encoding was adopted fall back to the raw string.

use crate::db::Db;
use crate::models::{ConfigEntry, ExecutionMode, TradingPairConfig};
use chrono::Utc;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub struct ConfigStore {
    db: Db,
    cache: RwLock<HashMap<(String, String), String>>,
    pair_configs: RwLock<Vec<TradingPairConfig>>,
}

impl ConfigStore {
    pub fn load(db: Db) -> anyhow::Result<Arc<Self>> {
        let entries = db.load_all_config()?;
        let mut cache = HashMap::new();
        for e in entries {
            cache.insert((e.category.clone(), e.key.clone()), e.value.clone());
        }
        let pair_configs = db.load_pair_configs()?;
        Ok(Arc::new(Self {
            db,
            cache: RwLock::new(cache),
            pair_configs: RwLock::new(pair_configs),
        }))
    }

    /// Writes unconditionally and refreshes the cache.
    pub fn set(&self, category: &str, key: &str, value: &str, is_hot_reload: bool) -> anyhow::Result<()> {
        let entry = ConfigEntry {
            id: None,
            category: category.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            is_hot_reload,
            description: None,
            updated_at: Utc::now(),
        };
        self.db.upsert_config(&entry)?;
        self.cache
            .write()
            .insert((category.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    /// No-op if the key already exists — preserves operator edits across
    /// restarts (`spec.md` §4.6, §8 idempotence property).
    pub fn set_default(&self, category: &str, key: &str, value: &str) -> anyhow::Result<()> {
        if self.db.config_exists(category, key)? {
            debug!("config {}.{} already present, skipping default", category, key);
            return Ok(());
        }
        self.set(category, key, value, true)
    }

    /// Refreshes only the subset flagged `is_hot_reload` from storage.
    pub fn reload_hot(&self) -> anyhow::Result<()> {
        let entries = self.db.load_all_config()?;
        let mut cache = self.cache.write();
        for e in entries.into_iter().filter(|e| e.is_hot_reload) {
            cache.insert((e.category, e.key), e.value);
        }
        *self.pair_configs.write() = self.db.load_pair_configs()?;
        Ok(())
    }

    fn raw(&self, category: &str, key: &str) -> Option<String> {
        self.cache
            .read()
            .get(&(category.to_string(), key.to_string()))
            .cloned()
    }

    fn typed<T: DeserializeOwned>(&self, category: &str, key: &str, default: T) -> T {
        match self.raw(category, key) {
            Some(raw) => serde_json::from_str(&raw).unwrap_or(default),
            None => default,
        }
    }

    pub fn get_f64(&self, category: &str, key: &str, default: f64) -> f64 {
        self.typed(category, key, default)
    }

    pub fn get_bool(&self, category: &str, key: &str, default: bool) -> bool {
        self.typed(category, key, default)
    }

    pub fn get_i64(&self, category: &str, key: &str, default: i64) -> i64 {
        self.typed(category, key, default)
    }

    /// Falls back to the raw string itself (not JSON-decoded) since plain
    /// strings were historically stored unquoted.
    pub fn get_str(&self, category: &str, key: &str, default: &str) -> String {
        match self.raw(category, key) {
            Some(raw) => serde_json::from_str(&raw).unwrap_or(raw),
            None => default.to_string(),
        }
    }

    /// Resolves `(symbol, exchange)` overrides with the precedence in
    /// §4.6: exact `(symbol, exchange)` row > `(symbol, any)` row > none.
    pub fn pair_config(&self, symbol: &str, exchange: &str) -> Option<TradingPairConfig> {
        let configs = self.pair_configs.read();
        configs
            .iter()
            .find(|c| c.symbol == symbol && c.exchange.as_deref() == Some(exchange))
            .or_else(|| configs.iter().find(|c| c.symbol == symbol && c.exchange.is_none()))
            .cloned()
    }

    pub fn resolve_position_size(&self, symbol: &str, exchange: &str, strategy_category: &str) -> f64 {
        if let Some(pc) = self.pair_config(symbol, exchange) {
            if let Some(size) = pc.position_size {
                return size;
            }
        }
        self.get_f64(strategy_category, "position_size", 1000.0)
    }

    pub fn resolve_execution_mode(&self, symbol: &str, exchange: &str, strategy_category: &str, default: ExecutionMode) -> ExecutionMode {
        if let Some(pc) = self.pair_config(symbol, exchange) {
            if let Some(mode) = pc.execution_mode {
                return mode;
            }
        }
        match self.get_str(strategy_category, "execution_mode", "").as_str() {
            "auto" => ExecutionMode::Auto,
            "manual" => ExecutionMode::Manual,
            _ => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_default_preserves_operator_write_across_reload() {
        let db = Db::in_memory().unwrap();
        let store = ConfigStore::load(db).unwrap();
        store.set("risk", "max_drawdown", "0.25", true).unwrap();
        store.set_default("risk", "max_drawdown", "0.5").unwrap();
        assert_eq!(store.get_f64("risk", "max_drawdown", 0.0), 0.25);
    }

    #[test]
    fn unset_key_falls_back_to_default() {
        let db = Db::in_memory().unwrap();
        let store = ConfigStore::load(db).unwrap();
        assert_eq!(store.get_f64("strategy1", "min_funding_diff", 0.0001), 0.0001);
    }

    #[test]
    fn raw_string_without_json_quoting_still_parses() {
        let db = Db::in_memory().unwrap();
        let store = ConfigStore::load(db).unwrap();
        // simulate a pre-JSON row written directly
        store.set("global", "mode", "paper", true).unwrap();
        assert_eq!(store.get_str("global", "mode", "live"), "paper");
    }
}
