//! Exchange driver capability interface (§6).
//!
//! One async trait covers every venue; new exchanges plug in by
//! implementing it plus a symbol-normaliser. Modeled on the teacher's
//! `vault::execution::ExecutionAdapter` trait, generalized from "place one
//! order" to the full ticker/book/funding/account/order surface a hedged
//! funding-arb leg needs.

pub mod mock;
pub mod rest;

use crate::models::{ExchangeAccount, OrderBookDepth, OrderSide};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use mock::{MockDriver, MockQuote};
pub use rest::RestDriver;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ticker {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FundingInfo {
    pub rate: f64,
    pub predicted_rate: Option<f64>,
    pub next_funding_time_ms: i64,
    pub interval_ms: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TradingFees {
    pub maker: f64,
    pub taker: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub total_usdt: f64,
    pub positions_count: i64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub contracts: f64,
    pub entry_price: f64,
    pub notional: f64,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub amount: f64,
    pub is_futures: bool,
    /// `Some(price)` for limit orders, `None` for market.
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub check_depth: bool,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub venue_order_id: String,
    pub filled_amount: f64,
    pub average_price: f64,
    pub fee_cost: f64,
    pub fee_currency: Option<String>,
    pub status: VenueOrderStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VenueOrderStatus {
    Filled,
    Open,
    PartiallyFilled,
    Rejected,
    /// The venue returned "order not found" — treated as filled for fast
    /// market orders per §4.4.
    NotFound,
}

/// Per-venue capability set. Implementations normalise all symbols to
/// `BASE/USDT` before returning them and accept that form as input.
#[async_trait]
pub trait ExchangeDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn configure(&self, account: &ExchangeAccount) -> Result<()>;

    /// Lists the symbols available as USDT-settled perpetual swaps and as
    /// USDT spot pairs, both normalised to `BASE/USDT` (§4.1 symbol
    /// universe).
    async fn list_symbols(&self) -> Result<SymbolUniverse>;

    async fn get_spot_ticker(&self, symbol: &str) -> Result<Ticker>;
    async fn get_futures_ticker(&self, symbol: &str) -> Result<Ticker>;
    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingInfo>;
    async fn get_order_book(&self, symbol: &str, is_futures: bool, depth: usize) -> Result<OrderBookDepth>;
    async fn get_trading_fees(&self, symbol: &str) -> Result<TradingFees>;

    async fn get_account_info(&self) -> Result<AccountInfo>;
    async fn get_positions(&self) -> Result<Vec<VenuePosition>>;

    async fn create_order(&self, req: OrderRequest) -> Result<OrderAck>;
    async fn fetch_order(&self, venue_order_id: &str, symbol: &str) -> Result<OrderAck>;
    async fn fetch_funding_rate_history(&self, symbol: &str, limit: usize) -> Result<Vec<FundingInfo>>;
}

#[derive(Debug, Clone, Default)]
pub struct SymbolUniverse {
    pub futures: Vec<String>,
    pub spot: Vec<String>,
}

/// Normalises a venue-specific futures symbol (e.g. Binance's `BTCUSDT`,
/// OKX's `BTC-USDT-SWAP`) to the internal canonical `BASE/USDT` form.
pub fn normalize_symbol(raw: &str) -> String {
    let upper = raw.to_uppercase();
    let stripped = upper
        .trim_end_matches("-SWAP")
        .replace(':', "-");
    let base = stripped
        .trim_end_matches("-USDT")
        .trim_end_matches("USDT")
        .trim_end_matches('-')
        .to_string();
    format!("{}/USDT", base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_binance_style_symbol() {
        assert_eq!(normalize_symbol("BTCUSDT"), "BTC/USDT");
    }

    #[test]
    fn normalizes_okx_style_swap_symbol() {
        assert_eq!(normalize_symbol("BTC-USDT-SWAP"), "BTC/USDT");
    }
}
