//! Strategy executor (§4.3): turns opportunities into positions and owns
//! each position's lifecycle until it closes. Grounded on
//! `original_source/core/strategy_executor.py`.

use crate::collector::MarketCache;
use crate::config::ConfigStore;
use crate::db::Db;
use crate::models::{EntryDetails, ExecutionMode, Opportunity, OrderSide, Position, PositionStatus, RiskLevel, StrategyType};
use crate::order_manager::{LegRequest, OrderManager};
use crate::risk::RiskManager;
use anyhow::Result;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{error, info, warn};

const POSITION_MONITOR_INTERVAL: Duration = Duration::from_secs(5);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(45);
const FUNDING_ACCRUAL_EPSILON: f64 = 1e-4;

pub struct StrategyExecutor {
    db: Db,
    config: Arc<ConfigStore>,
    cache: MarketCache,
    risk: Arc<RiskManager>,
    orders: Arc<OrderManager>,
    queue: Mutex<VecDeque<Opportunity>>,
    paused: AtomicBool,
}

impl StrategyExecutor {
    pub fn new(db: Db, config: Arc<ConfigStore>, cache: MarketCache, risk: Arc<RiskManager>, orders: Arc<OrderManager>) -> Arc<Self> {
        Arc::new(Self {
            db,
            config,
            cache,
            risk,
            orders,
            queue: Mutex::new(VecDeque::new()),
            paused: AtomicBool::new(false),
        })
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Feeds a fresh opportunity batch: auto+low-risk candidates are
    /// enqueued, everything else awaits operator confirmation (not stored
    /// here — the operator surface is out of scope).
    pub async fn offer(&self, opportunities: Vec<Opportunity>) {
        let mut queue = self.queue.lock().await;
        for opp in opportunities {
            if opp.execution_mode == ExecutionMode::Auto && opp.risk_level == RiskLevel::Low {
                queue.push_back(opp);
            }
        }
    }

    pub async fn run_admission_loop(self: Arc<Self>) {
        loop {
            if self.paused.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            let next = self.queue.lock().await.pop_front();
            match next {
                Some(opportunity) => {
                    if let Err(e) = self.execute_opportunity(opportunity).await {
                        error!("execution_failed: {}", e);
                    }
                }
                None => tokio::time::sleep(Duration::from_millis(500)).await,
            }
        }
    }

    /// Admits one opportunity (§4.3 per-opportunity execution steps).
    async fn execute_opportunity(&self, opportunity: Opportunity) -> Result<()> {
        let open_positions = self.db.open_positions()?;
        let decision = self.risk.evaluate_entry(&opportunity, &open_positions);
        if !decision.passed {
            warn!("execution_failed: {} rejected by risk manager: {:?}", opportunity.id, decision.reason);
            return Ok(());
        }

        let mut position = Position {
            id: None,
            opportunity_id: Some(opportunity.id.clone()),
            strategy_type: opportunity.strategy,
            symbol: opportunity.symbol.clone(),
            exchanges: opportunity.exchanges.clone(),
            entry_details: opportunity.entry_details.clone(),
            position_size: decision.adjusted_position_size,
            current_pnl: 0.0,
            realized_pnl: 0.0,
            funding_collected: 0.0,
            fees_paid: 0.0,
            status: PositionStatus::Open,
            open_time: Utc::now(),
            close_time: None,
            trailing_stop_activated: false,
            best_price: None,
            activation_price: None,
            synced_from_exchange: false,
        };
        let position_id = self.db.insert_position(&position)?;
        position.id = Some(position_id);

        let open_result = self.open_legs(&opportunity, &position).await;
        match open_result {
            Ok(total_fee) => {
                position.fees_paid = total_fee;
                self.db.update_position(&position)?;
                info!("position_opened: {} ({} {})", position_id, opportunity.strategy, opportunity.symbol);
            }
            Err(e) => {
                position.status = PositionStatus::Failed;
                self.db.update_position(&position)?;
                error!("execution_failed: opening {} failed: {}", opportunity.id, e);
            }
        }
        Ok(())
    }

    async fn open_legs(&self, opportunity: &Opportunity, position: &Position) -> Result<f64, crate::order_manager::OrderManagerError> {
        let strategy_id = opportunity.id.clone();
        match opportunity.strategy {
            StrategyType::S1 => {
                let long_ex = position.exchanges.first().cloned().unwrap_or_default();
                let short_ex = position.exchanges.get(1).cloned().unwrap_or_default();
                let leg_a = LegRequest { exchange: long_ex, symbol: position.symbol.clone(), side: OrderSide::Buy, amount: position.position_size, is_futures: true, price: None, reduce_only: false };
                let leg_b = LegRequest { exchange: short_ex, symbol: position.symbol.clone(), side: OrderSide::Sell, amount: position.position_size, is_futures: true, price: None, reduce_only: false };
                let fill = self.orders.place_hedge_pair(&strategy_id, opportunity.strategy, leg_a, leg_b).await?;
                Ok(fill.total_fee)
            }
            StrategyType::S2a | StrategyType::S2b => {
                let exchange = position.exchanges.first().cloned().unwrap_or_default();
                let leg_spot = LegRequest { exchange: exchange.clone(), symbol: position.symbol.clone(), side: OrderSide::Buy, amount: position.position_size, is_futures: false, price: None, reduce_only: false };
                let leg_fut = LegRequest { exchange, symbol: position.symbol.clone(), side: OrderSide::Sell, amount: position.position_size, is_futures: true, price: None, reduce_only: false };
                let fill = self.orders.place_hedge_pair(&strategy_id, opportunity.strategy, leg_spot, leg_fut).await?;
                Ok(fill.total_fee)
            }
            StrategyType::S3 => {
                let exchange = position.exchanges.first().cloned().unwrap_or_default();
                let side = position.entry_details.direction.unwrap_or(OrderSide::Buy);
                let leg = LegRequest { exchange, symbol: position.symbol.clone(), side, amount: position.position_size, is_futures: true, price: None, reduce_only: false };
                let fill = self
                    .orders
                    .place_single_directional(&strategy_id, opportunity.strategy, &leg)
                    .await
                    .map_err(|e| crate::order_manager::OrderManagerError::LegAFailed(e.to_string()))?;
                Ok(fill.fee_cost)
            }
        }
    }

    pub async fn run_position_monitor_loop(self: Arc<Self>) {
        let mut ticker = interval(POSITION_MONITOR_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = self.monitor_tick().await {
                error!("position monitor tick failed: {}", e);
            }
        }
    }

    async fn monitor_tick(&self) -> Result<()> {
        for mut position in self.db.open_positions()? {
            if position.status == PositionStatus::EmergencyClosePending {
                self.close_position(&mut position, "emergency_close_pending").await?;
                continue;
            }

            self.recompute_funding_accrual(&mut position)?;

            if position.strategy_type == StrategyType::S3 {
                self.apply_directional_rules(&mut position).await?;
            } else {
                self.db.update_position(&position)?;
            }
        }
        Ok(())
    }

    /// Funding accrual (§4.3.3): always recomputed from persisted history,
    /// never accumulated tick-by-tick. Idempotent because it replays the
    /// full settlement history every call.
    fn recompute_funding_accrual(&self, position: &mut Position) -> Result<()> {
        let since = position.open_time.timestamp_millis();
        let until = Utc::now().timestamp_millis();

        let total = match position.strategy_type {
            StrategyType::S1 => {
                let long_ex = position.exchanges.first().cloned().unwrap_or_default();
                let short_ex = position.exchanges.get(1).cloned().unwrap_or_default();
                let long_history = self.db.funding_settlements_since(&long_ex, &position.symbol, since, until)?;
                let short_history = self.db.funding_settlements_since(&short_ex, &position.symbol, since, until)?;
                let mut total = 0.0;
                for short_rec in &short_history {
                    if let Some(long_rec) = long_history.iter().find(|r| r.next_funding_time == short_rec.next_funding_time) {
                        total += position.position_size * (short_rec.funding_rate - long_rec.funding_rate);
                    }
                }
                total
            }
            StrategyType::S2a | StrategyType::S2b => {
                let exchange = position.exchanges.first().cloned().unwrap_or_default();
                let history = self.db.funding_settlements_since(&exchange, &position.symbol, since, until)?;
                history.iter().map(|r| position.position_size * r.funding_rate).sum()
            }
            StrategyType::S3 => {
                let exchange = position.exchanges.first().cloned().unwrap_or_default();
                let history = self.db.funding_settlements_since(&exchange, &position.symbol, since, until)?;
                let sign = if position.entry_details.direction == Some(OrderSide::Sell) { 1.0 } else { -1.0 };
                history.iter().map(|r| sign * position.position_size * r.funding_rate).sum()
            }
        };

        if (total - position.funding_collected).abs() > FUNDING_ACCRUAL_EPSILON {
            position.funding_collected = total;
            self.db.update_position(position)?;
        }
        Ok(())
    }

    /// S3 directional rules (§4.3.1).
    async fn apply_directional_rules(&self, position: &mut Position) -> Result<()> {
        let Some(entry_price) = position.entry_details.entry_price else { return Ok(()) };
        let exchange = position.exchanges.first().cloned().unwrap_or_default();
        let is_short = position.entry_details.direction == Some(OrderSide::Sell);

        let now_price = {
            let cache = self.cache.read();
            cache.get(&exchange).and_then(|m| m.get(&position.symbol)).and_then(|s| s.futures_mid())
        };
        let Some(now_price) = now_price else { return Ok(()) };

        let pnl_pct = if is_short { (entry_price - now_price) / entry_price } else { (now_price - entry_price) / entry_price };
        position.current_pnl = position.position_size * pnl_pct;

        let pair_config = self.config.pair_config(&position.symbol, &exchange);
        let stop_loss_pct = pair_config.as_ref().and_then(|c| c.stop_loss_pct).unwrap_or_else(|| self.config.get_f64("strategy3", "stop_loss_pct", 0.05));
        if pnl_pct <= -stop_loss_pct {
            warn!("risk_alert: {} hit stop-loss at pnl_pct={:.4}", position.id.unwrap_or(0), pnl_pct);
            self.close_position(position, "stop_loss").await?;
            return Ok(());
        }

        let current_rate = {
            let cache = self.cache.read();
            cache.get(&exchange).and_then(|m| m.get(&position.symbol)).and_then(|s| s.funding_rate)
        };
        if let Some(rate) = current_rate {
            let short_exit = pair_config.as_ref().and_then(|c| c.short_exit_threshold).unwrap_or_else(|| self.config.get_f64("strategy3", "short_exit_threshold", 0.0));
            let long_exit = pair_config.as_ref().and_then(|c| c.long_exit_threshold).unwrap_or_else(|| self.config.get_f64("strategy3", "long_exit_threshold", 0.0));
            if (is_short && rate <= short_exit) || (!is_short && rate >= long_exit) {
                self.close_position(position, "funding_flip").await?;
                return Ok(());
            }
        }

        let trailing_enabled = pair_config.as_ref().and_then(|c| c.trailing_stop_enabled).unwrap_or_else(|| self.config.get_bool("strategy3", "trailing_stop_enabled", false));
        if trailing_enabled {
            let activation_pct = pair_config.as_ref().and_then(|c| c.trailing_activation_pct).unwrap_or_else(|| self.config.get_f64("strategy3", "trailing_activation_pct", 0.04));
            let callback_pct = pair_config.as_ref().and_then(|c| c.trailing_callback_pct).unwrap_or_else(|| self.config.get_f64("strategy3", "trailing_callback_pct", 0.04));

            if !position.trailing_stop_activated && pnl_pct >= activation_pct {
                position.trailing_stop_activated = true;
                position.best_price = Some(now_price);
                position.activation_price = Some(now_price);
            } else if position.trailing_stop_activated {
                let best = position.best_price.unwrap_or(now_price);
                let new_best = if is_short { best.min(now_price) } else { best.max(now_price) };
                position.best_price = Some(new_best);

                let retracement = if is_short { (now_price - new_best) / new_best } else { (new_best - now_price) / new_best };
                if retracement >= callback_pct {
                    info!("trailing_stop: {} retracement={:.4}", position.id.unwrap_or(0), retracement);
                    self.close_position(position, "trailing_stop").await?;
                    return Ok(());
                }
            }
        }

        self.db.update_position(position)?;
        Ok(())
    }

    /// Close protocol (§4.3.4): maps strategy + entry details to the
    /// inverse leg sequence and marks the position closed only on success.
    async fn close_position(&self, position: &mut Position, reason: &str) -> Result<()> {
        let strategy_id = position.opportunity_id.clone().unwrap_or_default();
        let result: anyhow::Result<f64> = match position.strategy_type {
            StrategyType::S1 => {
                let long_ex = position.exchanges.first().cloned().unwrap_or_default();
                let short_ex = position.exchanges.get(1).cloned().unwrap_or_default();
                let leg_a = LegRequest { exchange: long_ex, symbol: position.symbol.clone(), side: OrderSide::Sell, amount: position.position_size, is_futures: true, price: None, reduce_only: true };
                let leg_b = LegRequest { exchange: short_ex, symbol: position.symbol.clone(), side: OrderSide::Buy, amount: position.position_size, is_futures: true, price: None, reduce_only: true };
                self.orders.place_close_pair(&strategy_id, position.strategy_type, leg_a, leg_b).await.map(|f| f.total_fee).map_err(anyhow::Error::from)
            }
            StrategyType::S2a | StrategyType::S2b => {
                let exchange = position.exchanges.first().cloned().unwrap_or_default();
                let leg_spot = LegRequest { exchange: exchange.clone(), symbol: position.symbol.clone(), side: OrderSide::Sell, amount: position.position_size, is_futures: false, price: None, reduce_only: false };
                let leg_fut = LegRequest { exchange, symbol: position.symbol.clone(), side: OrderSide::Buy, amount: position.position_size, is_futures: true, price: None, reduce_only: true };
                self.orders.place_close_pair(&strategy_id, position.strategy_type, leg_spot, leg_fut).await.map(|f| f.total_fee).map_err(anyhow::Error::from)
            }
            StrategyType::S3 => {
                let exchange = position.exchanges.first().cloned().unwrap_or_default();
                let entry_side = position.entry_details.direction.unwrap_or(OrderSide::Buy);
                let leg = LegRequest { exchange, symbol: position.symbol.clone(), side: entry_side.opposite(), amount: position.position_size, is_futures: true, price: None, reduce_only: true };
                self.orders
                    .place_single_directional(&strategy_id, position.strategy_type, &leg)
                    .await
                    .map(|f| f.fee_cost)
            }
        };

        match result {
            Ok(fee) => {
                position.fees_paid += fee;
                position.status = PositionStatus::Closed;
                position.close_time = Some(Utc::now());
                self.db.update_position(position)?;
                info!("position_closed: {} ({})", position.id.unwrap_or(0), reason);
            }
            Err(e) => {
                error!("close protocol failed for position {}: {}", position.id.unwrap_or(0), e);
            }
        }
        Ok(())
    }

    pub async fn run_reconciliation_loop(self: Arc<Self>) {
        let mut ticker = interval(RECONCILE_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = self.reconcile().await {
                error!("reconciliation tick failed: {}", e);
            }
        }
    }

    /// Exchange reconciliation (§4.3.2): compares DB positions to live
    /// venue positions and reconciles drift, disappearance, and venue
    /// positions with no DB row. Venue drivers are reached via the order
    /// manager's configured set.
    async fn reconcile(&self) -> Result<()> {
        let mut tracked: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();

        for mut position in self.db.open_positions()? {
            let Some(exchange) = position.exchanges.first().cloned() else { continue };
            tracked.insert((exchange.clone(), position.symbol.clone()));

            match self.orders.fetch_venue_position(&exchange, &position.symbol).await {
                Ok(Some(venue_pos)) => {
                    let notional_drifted =
                        (venue_pos.notional - position.position_size).abs() / position.position_size.max(1.0) > 0.01;
                    let entry_price_drifted = match position.entry_details.entry_price {
                        Some(current) if current > 0.0 => (venue_pos.entry_price - current).abs() / current > 0.01,
                        _ => false,
                    };
                    if notional_drifted || entry_price_drifted {
                        position.position_size = venue_pos.notional;
                        position.entry_details.entry_price = Some(venue_pos.entry_price);
                        self.db.update_position(&position)?;
                        info!(
                            "position_updated: {} drifted (notional={}, entry_price={})",
                            position.id.unwrap_or(0),
                            venue_pos.notional,
                            venue_pos.entry_price
                        );
                    }
                }
                Ok(None) => {
                    position.status = PositionStatus::Closed;
                    position.close_time = Some(Utc::now());
                    self.db.update_position(&position)?;
                    warn!("position_auto_closed: {} not found on {}", position.id.unwrap_or(0), exchange);
                }
                Err(e) => debug_reconcile_error(&exchange, &position.symbol, &e),
            }
        }

        for exchange in self.orders.configured_exchanges() {
            let venue_positions = match self.orders.fetch_all_venue_positions(&exchange).await {
                Ok(positions) => positions,
                Err(e) => {
                    debug_reconcile_error(&exchange, "*", &e);
                    continue;
                }
            };
            for venue_pos in venue_positions {
                if tracked.contains(&(exchange.clone(), venue_pos.symbol.clone())) {
                    continue;
                }
                let direction = match venue_pos.side {
                    crate::exchange::PositionSide::Long => OrderSide::Buy,
                    crate::exchange::PositionSide::Short => OrderSide::Sell,
                };
                let synced = Position {
                    id: None,
                    opportunity_id: Some(format!("directional_funding_{}_{}", exchange, venue_pos.symbol)),
                    strategy_type: StrategyType::S3,
                    symbol: venue_pos.symbol.clone(),
                    exchanges: vec![exchange.clone()],
                    entry_details: EntryDetails {
                        exchange: Some(exchange.clone()),
                        direction: Some(direction),
                        entry_price: Some(venue_pos.entry_price),
                        ..Default::default()
                    },
                    position_size: venue_pos.notional,
                    current_pnl: 0.0,
                    realized_pnl: 0.0,
                    funding_collected: 0.0,
                    fees_paid: 0.0,
                    status: PositionStatus::Open,
                    open_time: Utc::now(),
                    close_time: None,
                    trailing_stop_activated: false,
                    best_price: None,
                    activation_price: None,
                    synced_from_exchange: true,
                };
                match self.db.insert_position(&synced) {
                    Ok(id) => info!("position_opened: {} (directional_funding synced from {})", id, exchange),
                    Err(e) => error!("failed to persist synced venue position on {}/{}: {}", exchange, venue_pos.symbol, e),
                }
            }
        }

        Ok(())
    }
}

fn debug_reconcile_error(exchange: &str, symbol: &str, e: &anyhow::Error) {
    tracing::debug!("reconciliation fetch for {}/{} failed: {}", exchange, symbol, e);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::{MockDriver, MockQuote};
    use crate::exchange::ExchangeDriver;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn setup() -> (Arc<StrategyExecutor>, Db) {
        let db = Db::in_memory().unwrap();
        let config = ConfigStore::load(db.clone()).unwrap();
        let cache: MarketCache = Arc::new(parking_lot::RwLock::new(HashMap::new()));
        let risk = RiskManager::new(db.clone(), config.clone());
        let binance = MockDriver::new("binance");
        binance.set_quote("BTC/USDT", MockQuote { futures_bid: 50_010.0, futures_ask: 50_020.0, taker_fee: 0.0004, ..Default::default() });
        let mut drivers: HashMap<String, Arc<dyn ExchangeDriver>> = HashMap::new();
        drivers.insert("binance".to_string(), Arc::new(binance));
        let orders = OrderManager::new(db.clone(), drivers, true);
        let executor = StrategyExecutor::new(db.clone(), config, cache, risk, orders);
        (executor, db)
    }

    #[tokio::test]
    async fn funding_accrual_is_idempotent_across_two_ticks() {
        let (executor, db) = setup();
        let mut position = Position {
            id: None,
            opportunity_id: Some("s3_BTC/USDT_binance_short".to_string()),
            strategy_type: StrategyType::S3,
            symbol: "BTC/USDT".to_string(),
            exchanges: vec!["binance".to_string()],
            entry_details: EntryDetails { direction: Some(OrderSide::Sell), entry_price: Some(50_000.0), ..Default::default() },
            position_size: 1000.0,
            current_pnl: 0.0,
            realized_pnl: 0.0,
            funding_collected: 0.0,
            fees_paid: 0.0,
            status: PositionStatus::Open,
            open_time: Utc::now() - chrono::Duration::hours(1),
            close_time: None,
            trailing_stop_activated: false,
            best_price: None,
            activation_price: None,
            synced_from_exchange: false,
        };
        let id = db.insert_position(&position).unwrap();
        position.id = Some(id);

        db.insert_funding_rate(&crate::models::FundingRateRecord {
            exchange: "binance".to_string(),
            symbol: "BTC/USDT".to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
            funding_rate: 0.0008,
            next_funding_time: Some(Utc::now().timestamp_millis()),
            funding_interval_ms: Some(8 * 3_600_000),
        })
        .unwrap();

        executor.recompute_funding_accrual(&mut position).unwrap();
        let first = position.funding_collected;
        executor.recompute_funding_accrual(&mut position).unwrap();
        assert_eq!(position.funding_collected, first);
        assert!((first - 0.8).abs() < 1e-9);
    }

    /// The collector samples every few seconds, so a single ~8h settlement
    /// instant accumulates many rows sharing one `next_funding_time`. Accrual
    /// must count that instant once, using the newest sample.
    #[tokio::test]
    async fn funding_accrual_dedupes_multiple_samples_sharing_one_instant() {
        let (executor, db) = setup();
        let mut position = Position {
            id: None,
            opportunity_id: Some("s3_BTC/USDT_binance_short".to_string()),
            strategy_type: StrategyType::S3,
            symbol: "BTC/USDT".to_string(),
            exchanges: vec!["binance".to_string()],
            entry_details: EntryDetails { direction: Some(OrderSide::Sell), entry_price: Some(50_000.0), ..Default::default() },
            position_size: 1000.0,
            current_pnl: 0.0,
            realized_pnl: 0.0,
            funding_collected: 0.0,
            fees_paid: 0.0,
            status: PositionStatus::Open,
            open_time: Utc::now() - chrono::Duration::hours(1),
            close_time: None,
            trailing_stop_activated: false,
            best_price: None,
            activation_price: None,
            synced_from_exchange: false,
        };
        let id = db.insert_position(&position).unwrap();
        position.id = Some(id);

        let settlement_instant = Utc::now().timestamp_millis();
        // Several collector ticks observing the same upcoming settlement
        // instant, each with a different funding-rate reading; only the
        // newest (highest timestamp_ms) should count.
        for (offset_ms, rate) in [(0, 0.0002), (300_000, 0.0005), (600_000, 0.0008)] {
            db.insert_funding_rate(&crate::models::FundingRateRecord {
                exchange: "binance".to_string(),
                symbol: "BTC/USDT".to_string(),
                timestamp_ms: Utc::now().timestamp_millis() - 3_600_000 + offset_ms,
                funding_rate: rate,
                next_funding_time: Some(settlement_instant),
                funding_interval_ms: Some(8 * 3_600_000),
            })
            .unwrap();
        }

        executor.recompute_funding_accrual(&mut position).unwrap();
        assert!((position.funding_collected - 0.8).abs() < 1e-9, "expected only the newest (0.0008) sample to count once, got {}", position.funding_collected);
    }
}
