//! Core data model shared by every component: market cache entries, the
//! persisted entities, and the transient opportunity type.
//!
//! These are plain structs; persistence lives in `db`, policy lives in
//! `calculator`/`risk`/`executor`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One of the four arbitrage strategies the opportunity monitor scans for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    /// Cross-exchange funding-rate differential.
    S1,
    /// Spot-vs-perp funding capture on a single venue.
    S2a,
    /// Spot/futures basis arbitrage.
    S2b,
    /// Single-leg directional funding ride.
    S3,
}

impl StrategyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyType::S1 => "s1",
            StrategyType::S2a => "s2a",
            StrategyType::S2b => "s2b",
            StrategyType::S3 => "s3",
        }
    }
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether an opportunity auto-enqueues or waits for operator confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    EmergencyClosePending,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Closed,
    Cancelled,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

/// Tags an order with why it was placed, so P&L reporting can exclude
/// rollback/close legs from normal strategy attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPurpose {
    Open,
    Close,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSeverity {
    Warning,
    Critical,
    Emergency,
}

/// In-memory-only snapshot of a venue's current view of one symbol.
/// Every field is optional; consumers must check presence before use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketSample {
    pub exchange: String,
    pub symbol: String,
    pub spot_bid: Option<f64>,
    pub spot_ask: Option<f64>,
    pub spot_last: Option<f64>,
    pub futures_bid: Option<f64>,
    pub futures_ask: Option<f64>,
    pub futures_last: Option<f64>,
    pub spot_bid_depth: Option<f64>,
    pub spot_ask_depth: Option<f64>,
    pub futures_bid_depth: Option<f64>,
    pub futures_ask_depth: Option<f64>,
    pub maker_fee: Option<f64>,
    pub taker_fee: Option<f64>,
    pub funding_rate: Option<f64>,
    pub next_funding_time: Option<i64>,
    pub funding_interval_ms: Option<i64>,
    pub sampled_at: Option<DateTime<Utc>>,
}

impl MarketSample {
    pub fn has_futures(&self) -> bool {
        self.futures_bid.is_some() && self.futures_ask.is_some()
    }

    pub fn has_spot(&self) -> bool {
        self.spot_bid.is_some() && self.spot_ask.is_some()
    }

    pub fn futures_mid(&self) -> Option<f64> {
        Some((self.futures_bid? + self.futures_ask?) / 2.0)
    }
}

/// One persisted funding-rate sample, keyed by (exchange, symbol, timestamp).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRateRecord {
    pub exchange: String,
    pub symbol: String,
    pub timestamp_ms: i64,
    pub funding_rate: f64,
    pub next_funding_time: Option<i64>,
    pub funding_interval_ms: Option<i64>,
}

/// Per-(symbol, exchange) override of strategy thresholds. Missing rows
/// fall back to a synthesized default built from global strategy config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingPairConfig {
    pub id: Option<i64>,
    pub symbol: String,
    /// `None` matches any exchange (a symbol-wide override).
    pub exchange: Option<String>,
    pub min_funding_diff: Option<f64>,
    pub min_funding_rate: Option<f64>,
    pub min_basis: Option<f64>,
    pub max_price_diff: Option<f64>,
    pub max_basis_deviation: Option<f64>,
    pub position_size: Option<f64>,
    pub execution_mode: Option<ExecutionMode>,
    pub stop_loss_pct: Option<f64>,
    pub short_exit_threshold: Option<f64>,
    pub long_exit_threshold: Option<f64>,
    pub trailing_stop_enabled: Option<bool>,
    pub trailing_activation_pct: Option<f64>,
    pub trailing_callback_pct: Option<f64>,
    pub max_positions: Option<i64>,
    pub priority: i64,
    pub is_active: bool,
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Decrypted-in-memory exchange credentials. The DB row stores the
/// encrypted fields; `crypto` decrypts on load into this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeAccount {
    pub id: Option<i64>,
    pub exchange_name: String,
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Transient candidate trade produced by a single opportunity scan. The
/// full list is replaced atomically each scan; only `id` is stable across
/// scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub strategy: StrategyType,
    pub execution_mode: ExecutionMode,
    pub risk_level: RiskLevel,
    pub score: f64,
    pub symbol: String,
    pub exchanges: Vec<String>,
    pub funding_rate: Option<f64>,
    pub basis: Option<f64>,
    pub position_size: f64,
    pub expected_return_per_period: f64,
    pub expected_return_pct: f64,
    pub annualized_return_pct: f64,
    pub entry_details: EntryDetails,
    pub detected_at: DateTime<Utc>,
}

/// Where a hedge position's legs are currently parked, tagged with enough
/// of the detection snapshot that the close protocol (§4.3.4) and funding
/// accrual (§4.3.3) can replay it without re-reading the opportunity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryDetails {
    pub long_exchange: Option<String>,
    pub short_exchange: Option<String>,
    pub exchange: Option<String>,
    pub direction: Option<OrderSide>,
    pub entry_price: Option<f64>,
    pub entry_long_price: Option<f64>,
    pub entry_short_price: Option<f64>,
    pub funding_rate: Option<f64>,
    pub basis: Option<f64>,
    pub expected_return: Option<f64>,
}

/// Persisted, mutable position row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Option<i64>,
    pub opportunity_id: Option<String>,
    pub strategy_type: StrategyType,
    pub symbol: String,
    pub exchanges: Vec<String>,
    pub entry_details: EntryDetails,
    pub position_size: f64,
    pub current_pnl: f64,
    pub realized_pnl: f64,
    pub funding_collected: f64,
    pub fees_paid: f64,
    pub status: PositionStatus,
    pub open_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub trailing_stop_activated: bool,
    pub best_price: Option<f64>,
    pub activation_price: Option<f64>,
    pub synced_from_exchange: bool,
}

impl Position {
    pub fn pnl_pct(&self) -> f64 {
        if self.position_size <= 0.0 {
            0.0
        } else {
            self.current_pnl / self.position_size
        }
    }
}

/// Persisted order row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Option<i64>,
    pub strategy_id: Option<String>,
    pub strategy_type: StrategyType,
    pub purpose: OrderPurpose,
    pub exchange: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub is_futures: bool,
    pub price: Option<f64>,
    pub requested_amount: f64,
    pub filled_amount: f64,
    pub status: OrderStatus,
    pub venue_order_id: Option<String>,
    pub fee_cost: f64,
    pub fee_currency: Option<String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// Persisted risk event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    pub id: Option<i64>,
    pub severity: RiskSeverity,
    pub event_type: String,
    pub description: String,
    pub position_id: Option<i64>,
    pub is_handled: bool,
    pub timestamp: DateTime<Utc>,
}

impl RiskEvent {
    pub fn new(severity: RiskSeverity, event_type: &str, description: impl Into<String>) -> Self {
        Self {
            id: None,
            severity,
            event_type: event_type.to_string(),
            description: description.into(),
            position_id: None,
            is_handled: false,
            timestamp: Utc::now(),
        }
    }

    pub fn with_position(mut self, position_id: i64) -> Self {
        self.position_id = Some(position_id);
        self
    }
}

/// Persisted config row: `(category, key)` unique, value is a JSON string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub id: Option<i64>,
    pub category: String,
    pub key: String,
    pub value: String,
    pub is_hot_reload: bool,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Bid/ask levels and their summed depth, used by the order manager's
/// pre-trade depth check and by S1's slippage estimate.
#[derive(Debug, Clone, Default)]
pub struct OrderBookDepth {
    pub bid_levels: Vec<(f64, f64)>,
    pub ask_levels: Vec<(f64, f64)>,
    pub bid_depth: f64,
    pub ask_depth: f64,
}

/// Process-wide bootstrap config read from the environment. The
/// hot-reloadable trading config itself lives in the `config` table and is
/// owned by `config::ConfigStore` — this struct only covers process-level
/// concerns decided once at startup.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub database_path: String,
    pub enable_trading: bool,
    pub data_dir: String,
    pub http_bind: String,
}

impl ProcessConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            database_path: std::env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "funding_arb.db".to_string()),
            enable_trading: std::env::var("ENABLE_TRADING")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            data_dir: std::env::var("DATA_DIR").unwrap_or_else(|_| ".".to_string()),
            http_bind: std::env::var("HTTP_BIND")
                .unwrap_or_else(|_| "127.0.0.1:8090".to_string()),
        }
    }
}

/// Flattened strategy/risk thresholds resolved for one candidate, after
/// applying the pair-config precedence rule (§4.6). Carried around instead
/// of re-resolving config on every formula call.
#[derive(Debug, Clone, Default)]
pub struct ResolvedThresholds {
    pub values: HashMap<String, f64>,
}

impl ResolvedThresholds {
    pub fn get(&self, key: &str, default: f64) -> f64 {
        self.values.get(key).copied().unwrap_or(default)
    }
}
