//! Exchange account store (§4.6): loads active rows at startup, decrypts
//! into an in-memory cache, and encrypts on every subsequent write.

use crate::crypto::Crypto;
use crate::db::Db;
use crate::models::ExchangeAccount;
use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub struct ExchangeAccountStore {
    db: Db,
    crypto: Arc<Crypto>,
    cache: RwLock<HashMap<String, ExchangeAccount>>,
}

impl ExchangeAccountStore {
    pub fn load(db: Db, crypto: Arc<Crypto>) -> Result<Arc<Self>> {
        let rows = db.load_active_accounts()?;
        let mut cache = HashMap::new();
        for mut row in rows {
            row.api_key = crypto.decrypt_or_legacy(&row.api_key);
            row.api_secret = crypto.decrypt_or_legacy(&row.api_secret);
            row.passphrase = row.passphrase.map(|p| crypto.decrypt_or_legacy(&p));
            cache.insert(row.exchange_name.clone(), row);
        }
        info!("🔑 loaded {} active exchange account(s)", cache.len());
        Ok(Arc::new(Self {
            db,
            crypto,
            cache: RwLock::new(cache),
        }))
    }

    pub fn get(&self, exchange: &str) -> Option<ExchangeAccount> {
        self.cache.read().get(exchange).cloned()
    }

    pub fn all(&self) -> Vec<ExchangeAccount> {
        self.cache.read().values().cloned().collect()
    }

    /// Encrypts secrets before persisting, then updates the plaintext cache.
    pub fn add_account(
        &self,
        exchange_name: &str,
        api_key: &str,
        api_secret: &str,
        passphrase: Option<&str>,
    ) -> Result<()> {
        let encrypted = ExchangeAccount {
            id: None,
            exchange_name: exchange_name.to_string(),
            api_key: self.crypto.encrypt(api_key)?,
            api_secret: self.crypto.encrypt(api_secret)?,
            passphrase: passphrase.map(|p| self.crypto.encrypt(p)).transpose()?,
            is_active: true,
            created_at: Utc::now(),
        };
        self.db.upsert_account(&encrypted)?;

        let plain = ExchangeAccount {
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            passphrase: passphrase.map(|p| p.to_string()),
            ..encrypted
        };
        self.cache
            .write()
            .insert(exchange_name.to_string(), plain);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_account_round_trips_through_encryption() {
        let dir = tempfile::tempdir().unwrap();
        let crypto = Arc::new(Crypto::load_or_generate(dir.path().to_str().unwrap()).unwrap());
        let db = Db::in_memory().unwrap();
        let store = ExchangeAccountStore::load(db, crypto).unwrap();

        store
            .add_account("binance", "key123", "secret456", None)
            .unwrap();

        let loaded = store.get("binance").unwrap();
        assert_eq!(loaded.api_key, "key123");
        assert_eq!(loaded.api_secret, "secret456");
    }

    #[test]
    fn reload_decrypts_previously_persisted_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let key_dir = dir.path().to_str().unwrap();
        let crypto = Arc::new(Crypto::load_or_generate(key_dir).unwrap());
        let db = Db::in_memory().unwrap();
        let store = ExchangeAccountStore::load(db.clone(), crypto.clone()).unwrap();
        store
            .add_account("okx", "okx-key", "okx-secret", Some("pass"))
            .unwrap();

        let reloaded = ExchangeAccountStore::load(db, crypto).unwrap();
        let account = reloaded.get("okx").unwrap();
        assert_eq!(account.api_key, "okx-key");
        assert_eq!(account.passphrase.as_deref(), Some("pass"));
    }
}
