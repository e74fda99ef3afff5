//! Opportunity monitor (§4.2): scans the collector's market cache every
//! `opportunity_scan_interval` seconds and produces a fully re-ranked,
//! atomically-replaced `Opportunity` list. Grounded on
//! `original_source/core/opportunity_monitor.py` and
//! `arbitrage::engine::ArbitrageEngine::scan_opportunities`'s shape.

use crate::calculator::{
    calculate_score, estimate_slippage, resolve_funding_periods, s1_net_profit, s2a_net_profit,
    s2b_net_profit, s3_expected_return, S1Inputs, S2aInputs, S2bInputs,
};
use crate::collector::MarketCache;
use crate::config::ConfigStore;
use crate::db::Db;
use crate::models::{EntryDetails, ExecutionMode, MarketSample, Opportunity, OrderSide, RiskLevel, StrategyType};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;

pub struct OpportunityMonitor {
    db: Db,
    config: Arc<ConfigStore>,
    cache: MarketCache,
    opportunities: RwLock<Vec<Opportunity>>,
    running: AtomicBool,
    scan_interval: Duration,
    listeners: broadcast::Sender<Arc<Vec<Opportunity>>>,
}

impl OpportunityMonitor {
    pub fn new(db: Db, config: Arc<ConfigStore>, cache: MarketCache, scan_interval_secs: u64) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(16);
        Arc::new(Self {
            db,
            config,
            cache,
            opportunities: RwLock::new(Vec::new()),
            running: AtomicBool::new(true),
            scan_interval: Duration::from_secs(scan_interval_secs.max(1)),
            listeners: tx,
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<Opportunity>>> {
        self.listeners.subscribe()
    }

    pub fn current(&self) -> Vec<Opportunity> {
        self.opportunities.read().clone()
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.scan_interval);
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            self.scan();
        }
    }

    /// Produces a fully re-ranked list from the current snapshot. Falls
    /// back to the last minute of persisted prices/funding if the
    /// in-memory snapshot is empty.
    pub fn scan(&self) {
        let snapshot = self.snapshot();
        let mut found = Vec::new();

        found.extend(self.scan_s1(&snapshot));
        found.extend(self.scan_s2a(&snapshot));
        found.extend(self.scan_s2b(&snapshot));
        found.extend(self.scan_s3(&snapshot));

        found.sort_by(|a, b| b.expected_return_pct.partial_cmp(&a.expected_return_pct).unwrap_or(std::cmp::Ordering::Equal));

        *self.opportunities.write() = found.clone();
        let _ = self.listeners.send(Arc::new(found));
    }

    fn snapshot(&self) -> HashMap<String, HashMap<String, MarketSample>> {
        let snapshot = self.cache.read().clone();
        if !snapshot.is_empty() {
            return snapshot;
        }
        // empty in-memory cache: fall back to the last minute of persisted
        // data (§4.2).
        let since = Utc::now().timestamp_millis() - 60_000;
        let mut rebuilt: HashMap<String, HashMap<String, MarketSample>> = HashMap::new();
        if let Ok(rows) = self.db.recent_market_prices(since) {
            for (exchange, symbol, sample) in rows {
                rebuilt.entry(exchange).or_default().insert(symbol, sample);
            }
        }
        rebuilt
    }

    fn position_size(&self, symbol: &str, exchange: &str, category: &str) -> f64 {
        self.config.resolve_position_size(symbol, exchange, category)
    }

    fn execution_mode(&self, symbol: &str, exchange: &str, category: &str, default: ExecutionMode) -> ExecutionMode {
        self.config.resolve_execution_mode(symbol, exchange, category, default)
    }

    fn scan_s1(&self, snapshot: &HashMap<String, HashMap<String, MarketSample>>) -> Vec<Opportunity> {
        if !self.config.get_bool("strategy1", "enabled", true) {
            return Vec::new();
        }
        let min_funding_diff = self.config.get_f64("strategy1", "min_funding_diff", 0.0002);
        let max_price_diff = self.config.get_f64("strategy1", "max_price_diff", 0.02);

        let mut by_symbol: HashMap<&str, Vec<(&str, &MarketSample)>> = HashMap::new();
        for (exchange, symbols) in snapshot {
            for (symbol, sample) in symbols {
                if sample.has_futures() && sample.funding_rate.is_some() {
                    by_symbol.entry(symbol.as_str()).or_default().push((exchange.as_str(), sample));
                }
            }
        }

        let mut out = Vec::new();
        for (symbol, venues) in by_symbol {
            for i in 0..venues.len() {
                for j in (i + 1)..venues.len() {
                    let (ex_a, sample_a) = venues[i];
                    let (ex_b, sample_b) = venues[j];
                    let rate_a = sample_a.funding_rate.unwrap();
                    let rate_b = sample_b.funding_rate.unwrap();
                    let (long_ex, short_ex, sample_long, sample_short, rate_long, rate_short) = if rate_a < rate_b {
                        (ex_a, ex_b, sample_a, sample_b, rate_a, rate_b)
                    } else {
                        (ex_b, ex_a, sample_b, sample_a, rate_b, rate_a)
                    };

                    if rate_short - rate_long <= min_funding_diff {
                        continue;
                    }

                    let (Some(mid_long), Some(mid_short)) = (sample_long.futures_mid(), sample_short.futures_mid()) else { continue };
                    let price_diff_pct = (mid_long - mid_short).abs() / mid_long;
                    if price_diff_pct > max_price_diff {
                        continue;
                    }

                    let notional = self.position_size(symbol, long_ex, "strategy1");
                    let depth_long = sample_long.futures_ask_depth.unwrap_or(notional * 10.0);
                    let depth_short = sample_short.futures_bid_depth.unwrap_or(notional * 10.0);
                    let slippage_long = estimate_slippage(notional, depth_long);
                    let slippage_short = estimate_slippage(notional, depth_short);

                    let inputs = S1Inputs {
                        notional,
                        rate_long,
                        rate_short,
                        taker_open_long: sample_long.taker_fee.unwrap_or(0.0004),
                        taker_open_short: sample_short.taker_fee.unwrap_or(0.0004),
                        maker_close_long: sample_long.maker_fee.unwrap_or(0.0002),
                        maker_close_short: sample_short.maker_fee.unwrap_or(0.0002),
                        slippage_long,
                        slippage_short,
                    };
                    let net = s1_net_profit(&inputs);
                    if net <= 0.0 {
                        continue;
                    }

                    let (_, periods_per_day) = resolve_funding_periods(sample_long.funding_interval_ms, &[]);
                    let net_pct = net / notional;
                    let annualized = net_pct * periods_per_day * 365.0 * 100.0;
                    let score = calculate_score(net_pct, price_diff_pct, annualized);

                    out.push(Opportunity {
                        id: format!("s1_{}_{}_{}", symbol, long_ex, short_ex),
                        strategy: StrategyType::S1,
                        execution_mode: self.execution_mode(symbol, long_ex, "strategy1", ExecutionMode::Auto),
                        risk_level: risk_level_for(price_diff_pct, max_price_diff),
                        score,
                        symbol: symbol.to_string(),
                        exchanges: vec![long_ex.to_string(), short_ex.to_string()],
                        funding_rate: Some(rate_short - rate_long),
                        basis: None,
                        position_size: notional,
                        expected_return_per_period: net,
                        expected_return_pct: net_pct * 100.0,
                        annualized_return_pct: annualized,
                        entry_details: EntryDetails {
                            long_exchange: Some(long_ex.to_string()),
                            short_exchange: Some(short_ex.to_string()),
                            entry_long_price: sample_long.futures_ask,
                            entry_short_price: sample_short.futures_bid,
                            funding_rate: Some(rate_short - rate_long),
                            expected_return: Some(net),
                            ..Default::default()
                        },
                        detected_at: Utc::now(),
                    });
                }
            }
        }
        out
    }

    fn scan_s2a(&self, snapshot: &HashMap<String, HashMap<String, MarketSample>>) -> Vec<Opportunity> {
        if !self.config.get_bool("strategy2a", "enabled", true) {
            return Vec::new();
        }
        let min_funding_rate = self.config.get_f64("strategy2a", "min_funding_rate", 0.0005);
        let max_basis_deviation = self.config.get_f64("strategy2a", "max_basis_deviation", 0.01);

        let mut out = Vec::new();
        for (exchange, symbols) in snapshot {
            for (symbol, sample) in symbols {
                if !sample.has_spot() || !sample.has_futures() {
                    continue;
                }
                let Some(rate) = sample.funding_rate else { continue };
                if rate <= min_funding_rate {
                    continue;
                }
                let (Some(futures_bid), Some(spot_ask)) = (sample.futures_bid, sample.spot_ask) else { continue };
                let basis = (futures_bid - spot_ask) / spot_ask;
                if basis.abs() > max_basis_deviation {
                    continue;
                }

                let notional = self.position_size(symbol, exchange, "strategy2a");
                let inputs = S2aInputs {
                    notional,
                    rate,
                    taker_open_spot: sample.taker_fee.unwrap_or(0.0004),
                    taker_open_fut: sample.taker_fee.unwrap_or(0.0004),
                    maker_close_spot: sample.maker_fee.unwrap_or(0.0002),
                    maker_close_fut: sample.maker_fee.unwrap_or(0.0002),
                };
                let net = s2a_net_profit(&inputs);
                if net <= 0.0 {
                    continue;
                }

                let (_, periods_per_day) = resolve_funding_periods(sample.funding_interval_ms, &[]);
                let net_pct = net / notional;
                let annualized = net_pct * periods_per_day * 365.0 * 100.0;
                let score = calculate_score(net_pct, basis.abs(), annualized);

                out.push(Opportunity {
                    id: format!("s2a_{}_{}", symbol, exchange),
                    strategy: StrategyType::S2a,
                    execution_mode: self.execution_mode(symbol, exchange, "strategy2a", ExecutionMode::Auto),
                    risk_level: risk_level_for(basis.abs(), max_basis_deviation),
                    score,
                    symbol: symbol.clone(),
                    exchanges: vec![exchange.clone()],
                    funding_rate: Some(rate),
                    basis: Some(basis),
                    position_size: notional,
                    expected_return_per_period: net,
                    expected_return_pct: net_pct * 100.0,
                    annualized_return_pct: annualized,
                    entry_details: EntryDetails {
                        exchange: Some(exchange.clone()),
                        entry_price: sample.spot_ask,
                        funding_rate: Some(rate),
                        basis: Some(basis),
                        expected_return: Some(net),
                        ..Default::default()
                    },
                    detected_at: Utc::now(),
                });
            }
        }
        out
    }

    fn scan_s2b(&self, snapshot: &HashMap<String, HashMap<String, MarketSample>>) -> Vec<Opportunity> {
        if !self.config.get_bool("strategy2b", "enabled", true) {
            return Vec::new();
        }
        let min_basis = self.config.get_f64("strategy2b", "min_basis", 0.02);

        let mut out = Vec::new();
        for (exchange, symbols) in snapshot {
            for (symbol, sample) in symbols {
                if !sample.has_spot() || !sample.has_futures() {
                    continue;
                }
                let (Some(futures_bid), Some(spot_ask)) = (sample.futures_bid, sample.spot_ask) else { continue };
                let basis = (futures_bid - spot_ask) / spot_ask;
                if basis < min_basis {
                    continue;
                }

                let rate = sample.funding_rate.unwrap_or(0.0);
                let (_, periods_per_day) = resolve_funding_periods(sample.funding_interval_ms, &[]);
                // estimated horizon: 1 day -> periods settled within it.
                let periods = periods_per_day;

                let notional = self.position_size(symbol, exchange, "strategy2b");
                let inputs = S2bInputs {
                    notional,
                    basis,
                    rate,
                    periods,
                    taker_open_spot: sample.taker_fee.unwrap_or(0.0004),
                    taker_open_fut: sample.taker_fee.unwrap_or(0.0004),
                    maker_close_spot: sample.maker_fee.unwrap_or(0.0002),
                    maker_close_fut: sample.maker_fee.unwrap_or(0.0002),
                };
                let net = s2b_net_profit(&inputs);
                if net <= 0.0 {
                    continue;
                }

                let net_pct = net / notional;
                let annualized = net_pct * 365.0 * 100.0;
                let score = calculate_score(net_pct, basis, annualized);

                out.push(Opportunity {
                    id: format!("s2b_{}_{}", symbol, exchange),
                    strategy: StrategyType::S2b,
                    execution_mode: ExecutionMode::Manual,
                    risk_level: if basis < 0.03 { RiskLevel::Medium } else { RiskLevel::High },
                    score,
                    symbol: symbol.clone(),
                    exchanges: vec![exchange.clone()],
                    funding_rate: Some(rate),
                    basis: Some(basis),
                    position_size: notional,
                    expected_return_per_period: net,
                    expected_return_pct: net_pct * 100.0,
                    annualized_return_pct: annualized,
                    entry_details: EntryDetails {
                        exchange: Some(exchange.clone()),
                        entry_price: sample.spot_ask,
                        funding_rate: Some(rate),
                        basis: Some(basis),
                        expected_return: Some(net),
                        ..Default::default()
                    },
                    detected_at: Utc::now(),
                });
            }
        }
        out
    }

    fn scan_s3(&self, snapshot: &HashMap<String, HashMap<String, MarketSample>>) -> Vec<Opportunity> {
        if !self.config.get_bool("strategy3", "enabled", true) {
            return Vec::new();
        }
        let min_funding_rate = self.config.get_f64("strategy3", "min_funding_rate", 0.0005);
        let check_basis = self.config.get_bool("strategy3", "check_basis", true);

        let mut out = Vec::new();
        for (exchange, symbols) in snapshot {
            for (symbol, sample) in symbols {
                if !sample.has_futures() {
                    continue;
                }
                let Some(rate) = sample.funding_rate else { continue };
                if rate.abs() < min_funding_rate {
                    continue;
                }
                let direction = if rate > 0.0 { OrderSide::Sell } else { OrderSide::Buy };

                if check_basis && sample.has_spot() {
                    let (Some(futures_bid), Some(futures_ask), Some(spot_bid), Some(spot_ask)) =
                        (sample.futures_bid, sample.futures_ask, sample.spot_bid, sample.spot_ask)
                    else {
                        continue;
                    };
                    let sane = match direction {
                        OrderSide::Sell => futures_bid > spot_ask,
                        OrderSide::Buy => futures_ask < spot_bid,
                    };
                    if !sane {
                        continue;
                    }
                }

                let entry_price = match direction {
                    OrderSide::Sell => sample.futures_bid,
                    OrderSide::Buy => sample.futures_ask,
                };
                let Some(entry_price) = entry_price else { continue };

                let (_, periods_per_day) = resolve_funding_periods(sample.funding_interval_ms, &[]);
                let expected_return = s3_expected_return(
                    rate,
                    periods_per_day,
                    sample.taker_fee.unwrap_or(0.0004),
                    sample.maker_fee.unwrap_or(0.0002),
                );
                if expected_return <= 0.0 {
                    continue;
                }

                let notional = self.position_size(symbol, exchange, "strategy3");
                let annualized = expected_return / 7.0 * 365.0 * 100.0;
                let score = calculate_score(expected_return / 7.0, 0.0, annualized);

                out.push(Opportunity {
                    id: format!("s3_{}_{}_{}", symbol, exchange, direction_str(direction)),
                    strategy: StrategyType::S3,
                    execution_mode: ExecutionMode::Auto,
                    risk_level: RiskLevel::Medium,
                    score,
                    symbol: symbol.clone(),
                    exchanges: vec![exchange.clone()],
                    funding_rate: Some(rate),
                    basis: None,
                    position_size: notional,
                    expected_return_per_period: expected_return * notional,
                    expected_return_pct: expected_return * 100.0,
                    annualized_return_pct: annualized,
                    entry_details: EntryDetails {
                        exchange: Some(exchange.clone()),
                        direction: Some(direction),
                        entry_price: Some(entry_price),
                        funding_rate: Some(rate),
                        expected_return: Some(expected_return * notional),
                        ..Default::default()
                    },
                    detected_at: Utc::now(),
                });
            }
        }
        out
    }
}

fn risk_level_for(magnitude: f64, ceiling: f64) -> RiskLevel {
    if ceiling <= 0.0 {
        return RiskLevel::Medium;
    }
    let ratio = magnitude / ceiling;
    if ratio < 0.33 {
        RiskLevel::Low
    } else if ratio < 0.66 {
        RiskLevel::Medium
    } else {
        RiskLevel::High
    }
}

fn direction_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "long",
        OrderSide::Sell => "short",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn monitor_with_snapshot() -> (Arc<OpportunityMonitor>, MarketCache) {
        let db = Db::in_memory().unwrap();
        let config = ConfigStore::load(db.clone()).unwrap();
        let cache: MarketCache = Arc::new(RwLock::new(HashMap::new()));
        let monitor = OpportunityMonitor::new(db, config, cache.clone(), 10);
        (monitor, cache)
    }

    #[test]
    fn s1_discards_price_anomaly() {
        let (monitor, cache) = monitor_with_snapshot();
        let mut map = HashMap::new();
        map.insert(
            "a".to_string(),
            HashMap::from([(
                "BTC/USDT".to_string(),
                MarketSample {
                    exchange: "a".to_string(),
                    symbol: "BTC/USDT".to_string(),
                    futures_bid: Some(49_000.0),
                    futures_ask: Some(49_010.0),
                    funding_rate: Some(0.0001),
                    taker_fee: Some(0.0002),
                    maker_fee: Some(0.0001),
                    ..Default::default()
                },
            )]),
        );
        map.insert(
            "b".to_string(),
            HashMap::from([(
                "BTC/USDT".to_string(),
                MarketSample {
                    exchange: "b".to_string(),
                    symbol: "BTC/USDT".to_string(),
                    futures_bid: Some(50_500.0),
                    futures_ask: Some(50_510.0),
                    funding_rate: Some(0.0007),
                    taker_fee: Some(0.0002),
                    maker_fee: Some(0.0001),
                    ..Default::default()
                },
            )]),
        );
        *cache.write() = map;
        monitor.config.set_default("strategy1", "max_price_diff", "0.02").unwrap();
        monitor.scan();
        assert!(monitor.current().is_empty());
    }

    #[test]
    fn opportunities_sorted_descending_by_expected_return() {
        let (monitor, cache) = monitor_with_snapshot();
        let mut map = HashMap::new();
        map.insert(
            "a".to_string(),
            HashMap::from([
                (
                    "BTC/USDT".to_string(),
                    MarketSample {
                        exchange: "a".to_string(),
                        symbol: "BTC/USDT".to_string(),
                        spot_bid: Some(49_990.0),
                        spot_ask: Some(50_000.0),
                        futures_bid: Some(50_100.0),
                        futures_ask: Some(50_110.0),
                        funding_rate: Some(0.001),
                        taker_fee: Some(0.0001),
                        maker_fee: Some(0.0001),
                        ..Default::default()
                    },
                ),
                (
                    "ETH/USDT".to_string(),
                    MarketSample {
                        exchange: "a".to_string(),
                        symbol: "ETH/USDT".to_string(),
                        spot_bid: Some(2_990.0),
                        spot_ask: Some(3_000.0),
                        futures_bid: Some(3_004.0),
                        futures_ask: Some(3_006.0),
                        funding_rate: Some(0.0006),
                        taker_fee: Some(0.0001),
                        maker_fee: Some(0.0001),
                        ..Default::default()
                    },
                ),
            ]),
        );
        *cache.write() = map;
        monitor.scan();
        let found = monitor.current();
        assert!(found.len() >= 2);
        for pair in found.windows(2) {
            assert!(pair[0].expected_return_pct >= pair[1].expected_return_pct);
        }
    }
}
