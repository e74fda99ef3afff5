//! Order manager (§4.4): places and tracks orders, guarantees hedge-leg
//! atomicity, and extracts/estimates fees. Grounded on
//! `original_source/core/order_manager.py`; the retry/back-off shape
//! mirrors `scrapers::polymarket_api`'s request loop.

use crate::db::Db;
use crate::exchange::{ExchangeDriver, OrderRequest, VenueOrderStatus};
use crate::models::{Order, OrderPurpose, OrderSide, OrderStatus, OrderType, RiskEvent, RiskSeverity, StrategyType};
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, warn};

const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);
const FILL_POLL_CEILING: Duration = Duration::from_secs(30);
const FILL_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEPTH_LEVELS: usize = 20;
const MIN_DEPTH_COVERAGE: f64 = 0.8;
const ESTIMATED_FEE_RATE: f64 = 0.0005;

#[derive(Debug, Clone)]
pub struct LegRequest {
    pub exchange: String,
    pub symbol: String,
    pub side: OrderSide,
    pub amount: f64,
    pub is_futures: bool,
    pub price: Option<f64>,
    pub reduce_only: bool,
}

#[derive(Debug, Clone)]
pub struct LegFill {
    pub order_id: i64,
    pub venue_order_id: String,
    pub filled_amount: f64,
    pub average_price: f64,
    pub fee_cost: f64,
}

#[derive(Debug, Clone)]
pub struct HedgeFill {
    pub leg_a: LegFill,
    pub leg_b: LegFill,
    pub total_fee: f64,
}

#[derive(Debug, Error)]
pub enum OrderManagerError {
    #[error("unknown exchange driver: {0}")]
    UnknownExchange(String),
    #[error("depth check failed: only {available:.2} of {requested:.2} notional available")]
    InsufficientDepth { available: f64, requested: f64 },
    #[error("order rejected by venue")]
    Rejected,
    #[error("leg A failed: {0}")]
    LegAFailed(String),
    #[error("leg B failed after leg A filled; rollback {rollback}: {reason}")]
    LegBFailed { reason: String, rollback: String },
}

pub struct OrderManager {
    db: Db,
    drivers: HashMap<String, Arc<dyn ExchangeDriver>>,
    trading_enabled: AtomicBool,
    running: AtomicBool,
}

impl OrderManager {
    pub fn new(db: Db, drivers: HashMap<String, Arc<dyn ExchangeDriver>>, trading_enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            db,
            drivers,
            trading_enabled: AtomicBool::new(trading_enabled),
            running: AtomicBool::new(true),
        })
    }

    pub fn set_trading_enabled(&self, enabled: bool) {
        self.trading_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Order-sync loop (§5): periodically reconciles `open`/`pending` order
    /// rows against their venue status. Default cadence mirrors the
    /// fill-poll interval used for single orders.
    pub async fn run_sync_loop(self: Arc<Self>, interval_secs: u64) {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if let Err(e) = self.sync_pending_orders().await {
                warn!("order sync tick failed: {}", e);
            }
        }
    }

    fn driver(&self, exchange: &str) -> Result<Arc<dyn ExchangeDriver>, OrderManagerError> {
        self.drivers
            .get(exchange)
            .cloned()
            .ok_or_else(|| OrderManagerError::UnknownExchange(exchange.to_string()))
    }

    /// Places a single, non-hedged leg (used for S3's directional entries
    /// and exits, which have no second leg to pair against).
    pub async fn place_single_directional(&self, strategy_id: &str, strategy_type: StrategyType, leg: &LegRequest) -> Result<LegFill> {
        self.place_single(strategy_id, strategy_type, OrderPurpose::Open, leg, true).await
    }

    /// Looks up one venue's live position for a symbol, used by the
    /// executor's reconciliation loop (§4.3.2).
    pub async fn fetch_venue_position(&self, exchange: &str, symbol: &str) -> Result<Option<crate::exchange::VenuePosition>> {
        let driver = self.driver(exchange).map_err(|e| anyhow!(e))?;
        let positions = driver.get_positions().await?;
        Ok(positions.into_iter().find(|p| p.symbol == symbol))
    }

    /// Lists every live position a venue reports, used by the executor's
    /// reconciliation loop (§4.3.2) to find venue positions with no DB row.
    pub async fn fetch_all_venue_positions(&self, exchange: &str) -> Result<Vec<crate::exchange::VenuePosition>> {
        let driver = self.driver(exchange).map_err(|e| anyhow!(e))?;
        driver.get_positions().await
    }

    /// Exchanges currently wired with a driver, used to enumerate untracked
    /// venue positions during reconciliation.
    pub fn configured_exchanges(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    /// Places a hedge pair, rolling back leg A if leg B fails (§4.4). The
    /// entire call is independent of simulation vs. live mode.
    pub async fn place_hedge_pair(
        &self,
        strategy_id: &str,
        strategy_type: StrategyType,
        leg_a: LegRequest,
        leg_b: LegRequest,
    ) -> Result<HedgeFill, OrderManagerError> {
        let fill_a = self
            .place_single(strategy_id, strategy_type, OrderPurpose::Open, &leg_a, true)
            .await
            .map_err(|e| OrderManagerError::LegAFailed(e.to_string()))?;

        match self
            .place_single(strategy_id, strategy_type, OrderPurpose::Open, &leg_b, true)
            .await
        {
            Ok(fill_b) => Ok(HedgeFill { total_fee: fill_a.fee_cost + fill_b.fee_cost, leg_a: fill_a, leg_b: fill_b }),
            Err(leg_b_err) => {
                let rollback_outcome = self.rollback_leg(strategy_id, strategy_type, &leg_a).await;
                match rollback_outcome {
                    Ok(_) => Err(OrderManagerError::LegBFailed {
                        reason: leg_b_err.to_string(),
                        rollback: "succeeded".to_string(),
                    }),
                    Err(rollback_err) => {
                        error!(
                            "🚨 rollback of leg A ({}/{}) failed after leg B failure: {}",
                            leg_a.exchange, leg_a.symbol, rollback_err
                        );
                        let event = RiskEvent::new(
                            RiskSeverity::Emergency,
                            "rollback_failed",
                            format!(
                                "hedge pair {} leg A ({}/{}) could not be rolled back after leg B failure ({}): {}",
                                strategy_id, leg_a.exchange, leg_a.symbol, leg_b_err, rollback_err
                            ),
                        );
                        if let Err(e) = self.db.insert_risk_event(&event) {
                            error!("failed to persist rollback_failed risk event: {}", e);
                        }
                        Err(OrderManagerError::LegBFailed {
                            reason: leg_b_err.to_string(),
                            rollback: format!("failed: {}", rollback_err),
                        })
                    }
                }
            }
        }
    }

    /// Mirrors a hedge pair's close sequence. No rollback on second-leg
    /// failure — the first leg is already closed, so reversing it would
    /// re-open exposure. Logs critical and returns failure for the
    /// operator to resolve.
    pub async fn place_close_pair(
        &self,
        strategy_id: &str,
        strategy_type: StrategyType,
        leg_a: LegRequest,
        leg_b: LegRequest,
    ) -> Result<HedgeFill, OrderManagerError> {
        let fill_a = self
            .place_single(strategy_id, strategy_type, OrderPurpose::Close, &leg_a, true)
            .await
            .map_err(|e| OrderManagerError::LegAFailed(e.to_string()))?;

        match self
            .place_single(strategy_id, strategy_type, OrderPurpose::Close, &leg_b, true)
            .await
        {
            Ok(fill_b) => Ok(HedgeFill { total_fee: fill_a.fee_cost + fill_b.fee_cost, leg_a: fill_a, leg_b: fill_b }),
            Err(e) => {
                error!(
                    "close-pair second leg failed for {} after first leg closed on {}/{}: {} — operator must reconcile remaining exposure",
                    strategy_id, leg_a.exchange, leg_a.symbol, e
                );
                Err(OrderManagerError::LegBFailed { reason: e.to_string(), rollback: "not attempted (close pair)".to_string() })
            }
        }
    }

    /// Submits a market rollback order reversing `leg`, with
    /// `check_depth=false` per §4.4.
    async fn rollback_leg(&self, strategy_id: &str, strategy_type: StrategyType, leg: &LegRequest) -> Result<LegFill> {
        let reverse = LegRequest {
            exchange: leg.exchange.clone(),
            symbol: leg.symbol.clone(),
            side: leg.side.opposite(),
            amount: leg.amount,
            is_futures: leg.is_futures,
            price: None,
            reduce_only: true,
        };
        self.place_single(strategy_id, strategy_type, OrderPurpose::Rollback, &reverse, false).await
    }

    /// Places one leg: optional depth check, retried submission, fill
    /// polling, and persistence. `check_depth` is forced off for rollback
    /// legs regardless of the flag passed by the caller.
    async fn place_single(
        &self,
        strategy_id: &str,
        strategy_type: StrategyType,
        purpose: OrderPurpose,
        leg: &LegRequest,
        check_depth: bool,
    ) -> Result<LegFill> {
        let driver = self.driver(&leg.exchange)?;
        let simulating = !self.trading_enabled.load(Ordering::SeqCst);

        if check_depth && !simulating {
            self.check_depth(&driver, leg).await?;
        }

        let now = Utc::now();
        let order = Order {
            id: None,
            strategy_id: Some(strategy_id.to_string()),
            strategy_type,
            purpose,
            exchange: leg.exchange.clone(),
            symbol: leg.symbol.clone(),
            side: leg.side,
            order_type: if leg.price.is_some() { OrderType::Limit } else { OrderType::Market },
            is_futures: leg.is_futures,
            price: leg.price,
            requested_amount: leg.amount,
            filled_amount: 0.0,
            status: OrderStatus::Pending,
            venue_order_id: None,
            fee_cost: 0.0,
            fee_currency: None,
            create_time: now,
            update_time: now,
        };
        let order_id = self.db.insert_order(&order)?;

        let ack = self.submit_with_retry(&driver, leg).await?;
        if ack.status == VenueOrderStatus::Rejected {
            self.db.update_order_status(order_id, OrderStatus::Failed, 0.0, 0.0, None)?;
            return Err(anyhow!(OrderManagerError::Rejected));
        }

        let final_ack = if matches!(ack.status, VenueOrderStatus::Open | VenueOrderStatus::PartiallyFilled) {
            self.poll_until_terminal(&driver, &ack.venue_order_id, &leg.symbol).await
        } else {
            ack
        };

        let fee_cost = if final_ack.fee_cost > 0.0 {
            final_ack.fee_cost
        } else {
            final_ack.filled_amount * final_ack.average_price * ESTIMATED_FEE_RATE
        };

        let status = match final_ack.status {
            VenueOrderStatus::Filled | VenueOrderStatus::NotFound => OrderStatus::Filled,
            VenueOrderStatus::PartiallyFilled => OrderStatus::PartiallyFilled,
            VenueOrderStatus::Open => OrderStatus::Open,
            VenueOrderStatus::Rejected => OrderStatus::Failed,
        };
        self.db.update_order_status(order_id, status, final_ack.filled_amount, fee_cost, final_ack.fee_currency.as_deref())?;

        Ok(LegFill {
            order_id,
            venue_order_id: final_ack.venue_order_id,
            filled_amount: final_ack.filled_amount,
            average_price: final_ack.average_price,
            fee_cost,
        })
    }

    async fn check_depth(&self, driver: &Arc<dyn ExchangeDriver>, leg: &LegRequest) -> Result<()> {
        let book = driver.get_order_book(&leg.symbol, leg.is_futures, DEPTH_LEVELS).await?;
        let levels = match leg.side {
            OrderSide::Buy => &book.ask_levels,
            OrderSide::Sell => &book.bid_levels,
        };
        let requested = leg.amount;
        let mut cumulative = 0.0;
        for (price, qty) in levels {
            cumulative += price * qty;
            if cumulative >= requested {
                break;
            }
        }
        if cumulative < requested * MIN_DEPTH_COVERAGE {
            return Err(anyhow!(OrderManagerError::InsufficientDepth { available: cumulative, requested }));
        }
        let slippage_estimate = (requested - cumulative).max(0.0) / requested.max(1.0);
        if slippage_estimate > 0.01 {
            warn!("depth check for {}/{}: estimated slippage {:.4} exceeds 1%", leg.exchange, leg.symbol, slippage_estimate);
        }
        Ok(())
    }

    async fn submit_with_retry(&self, driver: &Arc<dyn ExchangeDriver>, leg: &LegRequest) -> Result<crate::exchange::OrderAck> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let req = OrderRequest {
                symbol: leg.symbol.clone(),
                side: leg.side,
                amount: leg.amount,
                is_futures: leg.is_futures,
                price: leg.price,
                reduce_only: leg.reduce_only,
                check_depth: false,
            };
            match driver.create_order(req).await {
                Ok(ack) => return Ok(ack),
                Err(e) if attempt < MAX_RETRIES => {
                    debug!("order submission attempt {} for {}/{} failed: {}, retrying", attempt, leg.exchange, leg.symbol, e);
                    sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn poll_until_terminal(&self, driver: &Arc<dyn ExchangeDriver>, venue_order_id: &str, symbol: &str) -> crate::exchange::OrderAck {
        let deadline = tokio::time::Instant::now() + FILL_POLL_CEILING;
        loop {
            match driver.fetch_order(venue_order_id, symbol).await {
                Ok(ack) if matches!(ack.status, VenueOrderStatus::Filled | VenueOrderStatus::NotFound | VenueOrderStatus::Rejected) => {
                    return ack;
                }
                Ok(ack) => {
                    if tokio::time::Instant::now() >= deadline {
                        warn!("order {} on {} unresolved after {:?}, marking unknown", venue_order_id, symbol, FILL_POLL_CEILING);
                        return ack;
                    }
                }
                Err(e) => {
                    debug!("fetch_order poll for {} failed: {}", venue_order_id, e);
                    if tokio::time::Instant::now() >= deadline {
                        return crate::exchange::OrderAck {
                            venue_order_id: venue_order_id.to_string(),
                            filled_amount: 0.0,
                            average_price: 0.0,
                            fee_cost: 0.0,
                            fee_currency: None,
                            status: VenueOrderStatus::Open,
                        };
                    }
                }
            }
            sleep(FILL_POLL_INTERVAL).await;
        }
    }

    /// Refreshes every `open|pending|partially_filled` order from its venue.
    pub async fn sync_pending_orders(&self) -> Result<()> {
        for order in self.db.open_orders()? {
            let Some(venue_order_id) = order.venue_order_id.as_deref() else { continue };
            let Ok(driver) = self.driver(&order.exchange) else { continue };
            match driver.fetch_order(venue_order_id, &order.symbol).await {
                Ok(ack) => {
                    let status = match ack.status {
                        VenueOrderStatus::Filled | VenueOrderStatus::NotFound => OrderStatus::Filled,
                        VenueOrderStatus::PartiallyFilled => OrderStatus::PartiallyFilled,
                        VenueOrderStatus::Open => OrderStatus::Open,
                        VenueOrderStatus::Rejected => OrderStatus::Failed,
                    };
                    if let Some(id) = order.id {
                        self.db.update_order_status(id, status, ack.filled_amount, ack.fee_cost, ack.fee_currency.as_deref())?;
                    }
                }
                Err(e) => debug!("sync_pending_orders: fetch_order for {} failed: {}", venue_order_id, e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::{MockDriver, MockQuote};
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn drivers_with(name: &str) -> HashMap<String, Arc<dyn ExchangeDriver>> {
        let driver = MockDriver::new(name);
        driver.set_quote(
            "BTC/USDT",
            MockQuote {
                spot_bid: 49_990.0,
                spot_ask: 50_000.0,
                futures_bid: 50_010.0,
                futures_ask: 50_020.0,
                funding_rate: 0.0005,
                next_funding_time_ms: 0,
                interval_ms: 8 * 3_600_000,
                maker_fee: 0.0002,
                taker_fee: 0.0004,
                depth: 1_000_000.0,
            },
        );
        let mut map: HashMap<String, Arc<dyn ExchangeDriver>> = HashMap::new();
        map.insert(name.to_string(), Arc::new(driver));
        map
    }

    fn leg(exchange: &str, side: OrderSide) -> LegRequest {
        LegRequest {
            exchange: exchange.to_string(),
            symbol: "BTC/USDT".to_string(),
            side,
            amount: 1000.0,
            is_futures: true,
            price: None,
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn hedge_pair_succeeds_when_both_legs_fill() {
        let db = Db::in_memory().unwrap();
        let mut drivers = drivers_with("binance");
        drivers.extend(drivers_with("okx"));
        let manager = OrderManager::new(db, drivers, true);

        let result = manager
            .place_hedge_pair("s1_BTC/USDT_binance_okx", StrategyType::S1, leg("binance", OrderSide::Buy), leg("okx", OrderSide::Sell))
            .await
            .unwrap();
        assert!(result.total_fee > 0.0);
        assert!(result.leg_a.venue_order_id.starts_with("SIM_"));
    }

    #[tokio::test]
    async fn hedge_pair_rolls_back_leg_a_when_leg_b_rejected() {
        let db = Db::in_memory().unwrap();
        let binance = MockDriver::new("binance");
        binance.set_quote("BTC/USDT", MockQuote { futures_bid: 50_010.0, futures_ask: 50_020.0, taker_fee: 0.0004, ..Default::default() });
        let okx = MockDriver::new("okx");
        okx.set_quote("BTC/USDT", MockQuote { futures_bid: 50_010.0, futures_ask: 50_020.0, taker_fee: 0.0004, ..Default::default() });
        okx.reject_orders.store(true, AtomicOrdering::SeqCst);

        let mut drivers: HashMap<String, Arc<dyn ExchangeDriver>> = HashMap::new();
        drivers.insert("binance".to_string(), Arc::new(binance));
        drivers.insert("okx".to_string(), Arc::new(okx));
        let manager = OrderManager::new(db.clone(), drivers, true);

        let err = manager
            .place_hedge_pair("s1_BTC/USDT_binance_okx", StrategyType::S1, leg("binance", OrderSide::Buy), leg("okx", OrderSide::Sell))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderManagerError::LegBFailed { .. }));

        // three orders persisted: leg A open, leg B attempt (rejected before insert? no - rejected after insert), rollback.
        let open_orders = db.open_orders().unwrap();
        assert_eq!(open_orders.len(), 0); // all terminal (filled or failed)
    }
}
