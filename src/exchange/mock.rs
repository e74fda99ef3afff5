//! Deterministic exchange driver used by tests and as the backing driver
//! in simulation mode.
//!
//! All reads come from a fixed in-memory table seeded at construction;
//! `create_order` always fills completely at the requested price (or the
//! mid-price for market orders) and returns a `SIM_`-prefixed id, matching
//! the simulation contract in §4.4.

use super::{
    AccountInfo, ExchangeDriver, FundingInfo, OrderAck, OrderRequest, SymbolUniverse, Ticker,
    TradingFees, VenueOrderStatus, VenuePosition,
};
use crate::models::{ExchangeAccount, OrderBookDepth};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, Default)]
pub struct MockQuote {
    pub spot_bid: f64,
    pub spot_ask: f64,
    pub futures_bid: f64,
    pub futures_ask: f64,
    pub funding_rate: f64,
    pub next_funding_time_ms: i64,
    pub interval_ms: i64,
    pub maker_fee: f64,
    pub taker_fee: f64,
    pub depth: f64,
}

pub struct MockDriver {
    name: String,
    quotes: RwLock<HashMap<String, MockQuote>>,
    positions: RwLock<Vec<VenuePosition>>,
    order_seq: AtomicU64,
    /// When true, `create_order` always returns a rejection — used to
    /// exercise the hedge-leg rollback path (§8 scenario 5).
    pub reject_orders: std::sync::atomic::AtomicBool,
}

impl MockDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quotes: RwLock::new(HashMap::new()),
            positions: RwLock::new(Vec::new()),
            order_seq: AtomicU64::new(0),
            reject_orders: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_quote(&self, symbol: &str, quote: MockQuote) {
        self.quotes.write().insert(symbol.to_string(), quote);
    }

    pub fn set_positions(&self, positions: Vec<VenuePosition>) {
        *self.positions.write() = positions;
    }

    fn quote(&self, symbol: &str) -> MockQuote {
        self.quotes.read().get(symbol).copied().unwrap_or_default()
    }
}

#[async_trait]
impl ExchangeDriver for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&self, _account: &ExchangeAccount) -> Result<()> {
        Ok(())
    }

    async fn list_symbols(&self) -> Result<SymbolUniverse> {
        let symbols: Vec<String> = self.quotes.read().keys().cloned().collect();
        Ok(SymbolUniverse {
            futures: symbols.clone(),
            spot: symbols,
        })
    }

    async fn get_spot_ticker(&self, symbol: &str) -> Result<Ticker> {
        let q = self.quote(symbol);
        Ok(Ticker {
            bid: q.spot_bid,
            ask: q.spot_ask,
            last: (q.spot_bid + q.spot_ask) / 2.0,
            timestamp_ms: 0,
        })
    }

    async fn get_futures_ticker(&self, symbol: &str) -> Result<Ticker> {
        let q = self.quote(symbol);
        Ok(Ticker {
            bid: q.futures_bid,
            ask: q.futures_ask,
            last: (q.futures_bid + q.futures_ask) / 2.0,
            timestamp_ms: 0,
        })
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingInfo> {
        let q = self.quote(symbol);
        Ok(FundingInfo {
            rate: q.funding_rate,
            predicted_rate: Some(q.funding_rate),
            next_funding_time_ms: q.next_funding_time_ms,
            interval_ms: if q.interval_ms > 0 { q.interval_ms } else { 8 * 3_600_000 },
        })
    }

    async fn get_order_book(&self, symbol: &str, _is_futures: bool, _depth: usize) -> Result<OrderBookDepth> {
        let q = self.quote(symbol);
        Ok(OrderBookDepth {
            bid_levels: vec![(q.futures_bid, q.depth)],
            ask_levels: vec![(q.futures_ask, q.depth)],
            bid_depth: q.depth,
            ask_depth: q.depth,
        })
    }

    async fn get_trading_fees(&self, symbol: &str) -> Result<TradingFees> {
        let q = self.quote(symbol);
        Ok(TradingFees {
            maker: q.maker_fee,
            taker: q.taker_fee,
        })
    }

    async fn get_account_info(&self) -> Result<AccountInfo> {
        Ok(AccountInfo {
            total_usdt: 1_000_000.0,
            positions_count: self.positions.read().len() as i64,
            timestamp_ms: 0,
        })
    }

    async fn get_positions(&self) -> Result<Vec<VenuePosition>> {
        Ok(self.positions.read().clone())
    }

    async fn create_order(&self, req: OrderRequest) -> Result<OrderAck> {
        if self.reject_orders.load(Ordering::SeqCst) {
            return Ok(OrderAck {
                venue_order_id: String::new(),
                filled_amount: 0.0,
                average_price: 0.0,
                fee_cost: 0.0,
                fee_currency: None,
                status: VenueOrderStatus::Rejected,
            });
        }
        let q = self.quote(&req.symbol);
        let fill_price = req.price.unwrap_or(match req.side {
            crate::models::OrderSide::Buy => q.futures_ask,
            crate::models::OrderSide::Sell => q.futures_bid,
        });
        let seq = self.order_seq.fetch_add(1, Ordering::SeqCst);
        Ok(OrderAck {
            venue_order_id: format!("SIM_{}_{}", self.name, seq),
            filled_amount: req.amount,
            average_price: fill_price,
            fee_cost: req.amount * fill_price * q.taker_fee.max(0.0004),
            fee_currency: Some("USDT".to_string()),
            status: VenueOrderStatus::Filled,
        })
    }

    async fn fetch_order(&self, venue_order_id: &str, _symbol: &str) -> Result<OrderAck> {
        Ok(OrderAck {
            venue_order_id: venue_order_id.to_string(),
            filled_amount: 0.0,
            average_price: 0.0,
            fee_cost: 0.0,
            fee_currency: None,
            status: VenueOrderStatus::Filled,
        })
    }

    async fn fetch_funding_rate_history(&self, symbol: &str, limit: usize) -> Result<Vec<FundingInfo>> {
        let info = self.get_funding_rate(symbol).await?;
        Ok(std::iter::repeat(info).take(limit.min(8)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderSide;

    #[tokio::test]
    async fn create_order_fills_fully_with_sim_prefixed_id() {
        let driver = MockDriver::new("binance");
        driver.set_quote(
            "BTC/USDT",
            MockQuote {
                futures_bid: 49_990.0,
                futures_ask: 50_010.0,
                taker_fee: 0.0004,
                ..Default::default()
            },
        );
        let ack = driver
            .create_order(OrderRequest {
                symbol: "BTC/USDT".to_string(),
                side: OrderSide::Buy,
                amount: 1000.0,
                is_futures: true,
                price: None,
                reduce_only: false,
                check_depth: false,
            })
            .await
            .unwrap();
        assert!(ack.venue_order_id.starts_with("SIM_"));
        assert_eq!(ack.filled_amount, 1000.0);
        assert_eq!(ack.status, VenueOrderStatus::Filled);
    }

    #[tokio::test]
    async fn reject_orders_flag_forces_rejection() {
        let driver = MockDriver::new("binance");
        driver.reject_orders.store(true, Ordering::SeqCst);
        let ack = driver
            .create_order(OrderRequest {
                symbol: "BTC/USDT".to_string(),
                side: OrderSide::Buy,
                amount: 1000.0,
                is_futures: true,
                price: None,
                reduce_only: false,
                check_depth: false,
            })
            .await
            .unwrap();
        assert_eq!(ack.status, VenueOrderStatus::Rejected);
    }
}
