//! Market-data collector (§4.1): keeps `MarketSample[exchange][symbol]`
//! fresh and persists price + funding samples. Grounded on
//! `original_source/core/data_collector.py`.

use crate::db::Db;
use crate::exchange::ExchangeDriver;
use crate::models::{FundingRateRecord, MarketSample};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

const COLD_START_WINDOW_MS: i64 = 10 * 60 * 1000;
const FUNDING_FANOUT_LIMIT: usize = 10;

pub type MarketCache = Arc<RwLock<HashMap<String, HashMap<String, MarketSample>>>>;

pub struct MarketDataCollector {
    db: Db,
    drivers: HashMap<String, Arc<dyn ExchangeDriver>>,
    cache: MarketCache,
    symbols: RwLock<HashMap<String, Vec<String>>>,
    running: AtomicBool,
    price_refresh_interval: Duration,
    funding_refresh_interval: Duration,
    listeners: broadcast::Sender<MarketCache>,
}

impl MarketDataCollector {
    pub fn new(
        db: Db,
        drivers: HashMap<String, Arc<dyn ExchangeDriver>>,
        price_refresh_secs: u64,
        funding_refresh_secs: u64,
    ) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(16);
        Arc::new(Self {
            db,
            drivers,
            cache: Arc::new(RwLock::new(HashMap::new())),
            symbols: RwLock::new(HashMap::new()),
            running: AtomicBool::new(true),
            price_refresh_interval: Duration::from_secs(price_refresh_secs.max(1)),
            funding_refresh_interval: Duration::from_secs(funding_refresh_secs.max(1)),
            listeners: tx,
        })
    }

    pub fn cache(&self) -> MarketCache {
        self.cache.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketCache> {
        self.listeners.subscribe()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Builds the per-venue symbol universe and preloads cache entries from
    /// rows persisted in the last `COLD_START_WINDOW_MS`, so consumers see
    /// data immediately on a cold start (§4.1).
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        self.rebuild_symbol_universe().await;

        let since = Utc::now().timestamp_millis() - COLD_START_WINDOW_MS;
        match self.db.recent_market_prices(since) {
            Ok(rows) => {
                let mut cache = self.cache.write();
                for (exchange, symbol, sample) in rows {
                    cache
                        .entry(exchange)
                        .or_insert_with(HashMap::new)
                        .insert(symbol, sample);
                }
                info!("collector: preloaded {} cached samples from storage", cache.values().map(|m| m.len()).sum::<usize>());
            }
            Err(e) => warn!("collector: cold-start preload failed: {}", e),
        }
        Ok(())
    }

    async fn rebuild_symbol_universe(&self) {
        let mut symbols = HashMap::new();
        for (name, driver) in &self.drivers {
            match driver.list_symbols().await {
                Ok(universe) => {
                    let mut combined = universe.futures.clone();
                    for s in universe.spot {
                        if !combined.contains(&s) {
                            combined.push(s);
                        }
                    }
                    symbols.insert(name.clone(), combined);
                }
                Err(e) => error!("collector: failed to list symbols for {}: {}", name, e),
            }
        }
        *self.symbols.write() = symbols;
    }

    /// Drops driver handles and clears caches. Safe to call while loops are
    /// running — in-flight iterations finish against the old snapshot.
    pub async fn reload(&self) {
        info!("collector: reload requested");
        self.cache.write().clear();
        self.rebuild_symbol_universe().await;
    }

    pub async fn run_price_loop(self: Arc<Self>) {
        let mut ticker = interval(self.price_refresh_interval);
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            self.price_tick().await;
        }
    }

    pub async fn run_funding_loop(self: Arc<Self>) {
        let mut ticker = interval(self.funding_refresh_interval);
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            self.funding_tick().await;
        }
    }

    async fn price_tick(&self) {
        let symbols_snapshot = self.symbols.read().clone();
        for (exchange, symbols) in symbols_snapshot {
            let Some(driver) = self.drivers.get(&exchange) else { continue };
            for symbol in symbols {
                let spot = driver.get_spot_ticker(&symbol).await;
                let futures = driver.get_futures_ticker(&symbol).await;
                let fees = driver.get_trading_fees(&symbol).await;

                if spot.is_err() && futures.is_err() {
                    debug!("collector: {}/{} price fetch failed, skipping", exchange, symbol);
                    continue;
                }

                let mut sample = {
                    let cache = self.cache.read();
                    cache
                        .get(&exchange)
                        .and_then(|m| m.get(&symbol))
                        .cloned()
                        .unwrap_or_else(|| MarketSample {
                            exchange: exchange.clone(),
                            symbol: symbol.clone(),
                            ..Default::default()
                        })
                };

                if let Ok(t) = spot {
                    sample.spot_bid = Some(t.bid);
                    sample.spot_ask = Some(t.ask);
                    sample.spot_last = Some(t.last);
                }
                if let Ok(t) = futures {
                    sample.futures_bid = Some(t.bid);
                    sample.futures_ask = Some(t.ask);
                    sample.futures_last = Some(t.last);
                }
                if let Ok(f) = fees {
                    sample.maker_fee = Some(f.maker);
                    sample.taker_fee = Some(f.taker);
                }
                sample.sampled_at = Some(Utc::now());

                self.cache
                    .write()
                    .entry(exchange.clone())
                    .or_insert_with(HashMap::new)
                    .insert(symbol.clone(), sample.clone());

                if let Err(e) = self.db.insert_market_price(&sample, Utc::now().timestamp_millis()) {
                    warn!("collector: persisting price for {}/{} failed: {}", exchange, symbol, e);
                }
            }
        }
        let _ = self.listeners.send(self.cache.clone());
    }

    async fn funding_tick(&self) {
        let symbols_snapshot = self.symbols.read().clone();
        for (exchange, symbols) in symbols_snapshot {
            let Some(driver) = self.drivers.get(&exchange).cloned() else { continue };
            let db = self.db.clone();
            let cache = self.cache.clone();
            let exchange2 = exchange.clone();

            stream::iter(symbols)
                .for_each_concurrent(FUNDING_FANOUT_LIMIT, |symbol| {
                    let driver = driver.clone();
                    let db = db.clone();
                    let cache = cache.clone();
                    let exchange = exchange2.clone();
                    async move {
                        let info = match driver.get_funding_rate(&symbol).await {
                            Ok(info) => info,
                            Err(e) => {
                                debug!("collector: funding fetch for {}/{} failed: {}", exchange, symbol, e);
                                return;
                            }
                        };

                        {
                            let mut cache = cache.write();
                            let entry = cache
                                .entry(exchange.clone())
                                .or_insert_with(HashMap::new)
                                .entry(symbol.clone())
                                .or_insert_with(|| MarketSample {
                                    exchange: exchange.clone(),
                                    symbol: symbol.clone(),
                                    ..Default::default()
                                });
                            entry.funding_rate = Some(info.rate);
                            entry.next_funding_time = Some(info.next_funding_time_ms);
                            entry.funding_interval_ms = Some(info.interval_ms);
                        }

                        let record = FundingRateRecord {
                            exchange: exchange.clone(),
                            symbol: symbol.clone(),
                            timestamp_ms: Utc::now().timestamp_millis(),
                            funding_rate: info.rate,
                            next_funding_time: Some(info.next_funding_time_ms),
                            funding_interval_ms: Some(info.interval_ms),
                        };
                        if let Err(e) = db.insert_funding_rate(&record) {
                            warn!("collector: persisting funding rate for {}/{} failed: {}", exchange, symbol, e);
                        }
                    }
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::{MockDriver, MockQuote};

    fn driver_with_btc() -> Arc<dyn ExchangeDriver> {
        let driver = MockDriver::new("binance");
        driver.set_quote(
            "BTC/USDT",
            MockQuote {
                spot_bid: 49_990.0,
                spot_ask: 50_000.0,
                futures_bid: 50_010.0,
                futures_ask: 50_020.0,
                funding_rate: 0.0005,
                next_funding_time_ms: Utc::now().timestamp_millis() + 3_600_000,
                interval_ms: 8 * 3_600_000,
                maker_fee: 0.0002,
                taker_fee: 0.0004,
                depth: 100_000.0,
            },
        );
        Arc::new(driver)
    }

    #[tokio::test]
    async fn price_tick_populates_cache_and_persists() {
        let db = Db::in_memory().unwrap();
        let mut drivers: HashMap<String, Arc<dyn ExchangeDriver>> = HashMap::new();
        drivers.insert("binance".to_string(), driver_with_btc());
        let collector = MarketDataCollector::new(db, drivers, 5, 300);
        collector
            .symbols
            .write()
            .insert("binance".to_string(), vec!["BTC/USDT".to_string()]);

        collector.price_tick().await;

        let cache = collector.cache();
        let sample = cache.read().get("binance").unwrap().get("BTC/USDT").unwrap().clone();
        assert_eq!(sample.spot_bid, Some(49_990.0));
        assert_eq!(sample.futures_ask, Some(50_020.0));
    }

    #[tokio::test]
    async fn funding_tick_populates_cache_and_persists() {
        let db = Db::in_memory().unwrap();
        let mut drivers: HashMap<String, Arc<dyn ExchangeDriver>> = HashMap::new();
        drivers.insert("binance".to_string(), driver_with_btc());
        let collector = MarketDataCollector::new(db.clone(), drivers, 5, 300);
        collector
            .symbols
            .write()
            .insert("binance".to_string(), vec!["BTC/USDT".to_string()]);

        collector.funding_tick().await;

        let cache = collector.cache();
        let sample = cache.read().get("binance").unwrap().get("BTC/USDT").unwrap().clone();
        assert_eq!(sample.funding_rate, Some(0.0005));
        assert_eq!(db.recent_funding_rates("binance", "BTC/USDT", 10).unwrap().len(), 1);
    }
}
