//! SQLite-backed persistence for every entity in `models`.
//!
//! One connection behind a `parking_lot::Mutex`, WAL mode, schema applied
//! as a single batch on open. Every table that tracks an operational hot
//! path (`orders`, `positions`) carries a covering index on `status`.

use crate::models::{
    ConfigEntry, EntryDetails, ExchangeAccount, FundingRateRecord, MarketSample, Order,
    OrderPurpose, OrderSide, OrderStatus, OrderType, Position, PositionStatus, RiskEvent,
    RiskSeverity, StrategyType, TradingPairConfig,
};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::sync::Arc;
use std::str::FromStr;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS config (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    is_hot_reload INTEGER NOT NULL DEFAULT 0,
    description TEXT,
    updated_at TEXT NOT NULL,
    UNIQUE(category, key)
);

CREATE TABLE IF NOT EXISTS exchange_accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange_name TEXT NOT NULL UNIQUE,
    api_key TEXT NOT NULL,
    api_secret TEXT NOT NULL,
    passphrase TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trading_pair_configs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    exchange TEXT,
    min_funding_diff REAL,
    min_funding_rate REAL,
    min_basis REAL,
    max_price_diff REAL,
    max_basis_deviation REAL,
    position_size REAL,
    execution_mode TEXT,
    stop_loss_pct REAL,
    short_exit_threshold REAL,
    long_exit_threshold REAL,
    trailing_stop_enabled INTEGER,
    trailing_activation_pct REAL,
    trailing_callback_pct REAL,
    max_positions INTEGER,
    priority INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    notes TEXT,
    updated_at TEXT NOT NULL,
    UNIQUE(symbol, exchange)
);

CREATE TABLE IF NOT EXISTS funding_rates (
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    funding_rate REAL NOT NULL,
    next_funding_time INTEGER,
    funding_interval_ms INTEGER,
    PRIMARY KEY (exchange, symbol, timestamp_ms)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_funding_rates_recent
    ON funding_rates(exchange, symbol, timestamp_ms DESC);

CREATE TABLE IF NOT EXISTS market_prices (
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    spot_bid REAL,
    spot_ask REAL,
    spot_price REAL,
    futures_bid REAL,
    futures_ask REAL,
    futures_price REAL,
    maker_fee REAL,
    taker_fee REAL,
    PRIMARY KEY (exchange, symbol, timestamp_ms)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_market_prices_recent
    ON market_prices(exchange, symbol, timestamp_ms DESC);

CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    strategy_id TEXT,
    strategy_type TEXT NOT NULL,
    purpose TEXT NOT NULL DEFAULT 'open',
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    order_type TEXT NOT NULL,
    is_futures INTEGER NOT NULL,
    price REAL,
    requested_amount REAL NOT NULL,
    filled_amount REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    venue_order_id TEXT,
    fee_cost REAL NOT NULL DEFAULT 0,
    fee_currency TEXT,
    create_time TEXT NOT NULL,
    update_time TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
CREATE INDEX IF NOT EXISTS idx_orders_strategy ON orders(strategy_id);

CREATE TABLE IF NOT EXISTS positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    opportunity_id TEXT,
    strategy_type TEXT NOT NULL,
    symbol TEXT NOT NULL,
    exchanges TEXT NOT NULL,
    entry_details TEXT NOT NULL,
    position_size REAL NOT NULL,
    current_pnl REAL NOT NULL DEFAULT 0,
    realized_pnl REAL NOT NULL DEFAULT 0,
    funding_collected REAL NOT NULL DEFAULT 0,
    fees_paid REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    open_time TEXT NOT NULL,
    close_time TEXT,
    trailing_stop_activated INTEGER NOT NULL DEFAULT 0,
    best_price REAL,
    activation_price REAL,
    synced_from_exchange INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);
CREATE INDEX IF NOT EXISTS idx_positions_symbol ON positions(symbol, status);

CREATE TABLE IF NOT EXISTS risk_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    severity TEXT NOT NULL,
    event_type TEXT NOT NULL,
    description TEXT NOT NULL,
    position_id INTEGER,
    is_handled INTEGER NOT NULL DEFAULT 0,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_risk_events_recent ON risk_events(timestamp DESC);
"#;

/// Thin wrapper over a single SQLite connection shared by every component.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let positions: i64 = conn
            .query_row("SELECT COUNT(*) FROM positions", [], |row| row.get(0))
            .unwrap_or(0);
        info!(
            "💾 database opened at {} ({} existing positions)",
            db_path, positions
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- config -------------------------------------------------------

    pub fn upsert_config(&self, entry: &ConfigEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO config (category, key, value, is_hot_reload, description, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(category, key) DO UPDATE SET
                value = excluded.value,
                is_hot_reload = excluded.is_hot_reload,
                description = excluded.description,
                updated_at = excluded.updated_at",
            params![
                entry.category,
                entry.key,
                entry.value,
                entry.is_hot_reload as i64,
                entry.description,
                entry.updated_at.to_rfc3339(),
            ],
        )
        .context("upsert_config failed")?;
        Ok(())
    }

    pub fn config_exists(&self, category: &str, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM config WHERE category = ?1 AND key = ?2",
                params![category, key],
                |row| row.get(0),
            )
            .optional()
            .context("config_exists query failed")?;
        Ok(found.is_some())
    }

    pub fn load_all_config(&self) -> Result<Vec<ConfigEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, category, key, value, is_hot_reload, description, updated_at FROM config")?;
        let rows = stmt
            .query_map([], |row| Self::row_to_config(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn row_to_config(row: &Row) -> rusqlite::Result<ConfigEntry> {
        Ok(ConfigEntry {
            id: Some(row.get(0)?),
            category: row.get(1)?,
            key: row.get(2)?,
            value: row.get(3)?,
            is_hot_reload: row.get::<_, i64>(4)? != 0,
            description: row.get(5)?,
            updated_at: parse_ts(&row.get::<_, String>(6)?),
        })
    }

    // ---- exchange accounts ---------------------------------------------

    pub fn upsert_account(&self, account: &ExchangeAccount) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO exchange_accounts (exchange_name, api_key, api_secret, passphrase, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(exchange_name) DO UPDATE SET
                api_key = excluded.api_key,
                api_secret = excluded.api_secret,
                passphrase = excluded.passphrase,
                is_active = excluded.is_active",
            params![
                account.exchange_name,
                account.api_key,
                account.api_secret,
                account.passphrase,
                account.is_active as i64,
                account.created_at.to_rfc3339(),
            ],
        )
        .context("upsert_account failed")?;
        Ok(())
    }

    pub fn load_active_accounts(&self) -> Result<Vec<ExchangeAccount>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, exchange_name, api_key, api_secret, passphrase, is_active, created_at
             FROM exchange_accounts WHERE is_active = 1",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ExchangeAccount {
                    id: Some(row.get(0)?),
                    exchange_name: row.get(1)?,
                    api_key: row.get(2)?,
                    api_secret: row.get(3)?,
                    passphrase: row.get(4)?,
                    is_active: row.get::<_, i64>(5)? != 0,
                    created_at: parse_ts(&row.get::<_, String>(6)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---- trading pair configs -------------------------------------------

    pub fn load_pair_configs(&self) -> Result<Vec<TradingPairConfig>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, symbol, exchange, min_funding_diff, min_funding_rate, min_basis,
                    max_price_diff, max_basis_deviation, position_size, execution_mode,
                    stop_loss_pct, short_exit_threshold, long_exit_threshold,
                    trailing_stop_enabled, trailing_activation_pct, trailing_callback_pct,
                    max_positions, priority, is_active, notes, updated_at
             FROM trading_pair_configs WHERE is_active = 1 ORDER BY priority DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let execution_mode: Option<String> = row.get(9)?;
                Ok(TradingPairConfig {
                    id: Some(row.get(0)?),
                    symbol: row.get(1)?,
                    exchange: row.get(2)?,
                    min_funding_diff: row.get(3)?,
                    min_funding_rate: row.get(4)?,
                    min_basis: row.get(5)?,
                    max_price_diff: row.get(6)?,
                    max_basis_deviation: row.get(7)?,
                    position_size: row.get(8)?,
                    execution_mode: execution_mode.and_then(|m| match m.as_str() {
                        "auto" => Some(crate::models::ExecutionMode::Auto),
                        "manual" => Some(crate::models::ExecutionMode::Manual),
                        _ => None,
                    }),
                    stop_loss_pct: row.get(10)?,
                    short_exit_threshold: row.get(11)?,
                    long_exit_threshold: row.get(12)?,
                    trailing_stop_enabled: row.get::<_, Option<i64>>(13)?.map(|v| v != 0),
                    trailing_activation_pct: row.get(14)?,
                    trailing_callback_pct: row.get(15)?,
                    max_positions: row.get(16)?,
                    priority: row.get(17)?,
                    is_active: row.get::<_, i64>(18)? != 0,
                    notes: row.get(19)?,
                    updated_at: parse_ts(&row.get::<_, String>(20)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---- funding rates / market prices -----------------------------------

    pub fn insert_funding_rate(&self, rec: &FundingRateRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO funding_rates
                (exchange, symbol, timestamp_ms, funding_rate, next_funding_time, funding_interval_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rec.exchange,
                rec.symbol,
                rec.timestamp_ms,
                rec.funding_rate,
                rec.next_funding_time,
                rec.funding_interval_ms,
            ],
        )
        .context("insert_funding_rate failed")?;
        Ok(())
    }

    pub fn recent_funding_rates(
        &self,
        exchange: &str,
        symbol: &str,
        limit: i64,
    ) -> Result<Vec<FundingRateRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT exchange, symbol, timestamp_ms, funding_rate, next_funding_time, funding_interval_ms
             FROM funding_rates WHERE exchange = ?1 AND symbol = ?2
             ORDER BY timestamp_ms DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![exchange, symbol, limit], |row| {
                Ok(FundingRateRecord {
                    exchange: row.get(0)?,
                    symbol: row.get(1)?,
                    timestamp_ms: row.get(2)?,
                    funding_rate: row.get(3)?,
                    next_funding_time: row.get(4)?,
                    funding_interval_ms: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Funding settlement rows in `[open_time, now]` for one (exchange,
    /// symbol), de-duplicated to the newest sample per `next_funding_time`
    /// instant. Used by the funding-accrual computation (§4.3.3).
    pub fn funding_settlements_since(
        &self,
        exchange: &str,
        symbol: &str,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<Vec<FundingRateRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT exchange, symbol, timestamp_ms, funding_rate, next_funding_time, funding_interval_ms
             FROM funding_rates AS f
             WHERE exchange = ?1 AND symbol = ?2
               AND next_funding_time BETWEEN ?3 AND ?4
               AND timestamp_ms = (
                   SELECT MAX(timestamp_ms) FROM funding_rates
                   WHERE exchange = f.exchange AND symbol = f.symbol
                     AND next_funding_time = f.next_funding_time
               )
             ORDER BY timestamp_ms ASC",
        )?;
        let rows = stmt
            .query_map(params![exchange, symbol, since_ms, until_ms], |row| {
                Ok(FundingRateRecord {
                    exchange: row.get(0)?,
                    symbol: row.get(1)?,
                    timestamp_ms: row.get(2)?,
                    funding_rate: row.get(3)?,
                    next_funding_time: row.get(4)?,
                    funding_interval_ms: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn insert_market_price(&self, sample: &MarketSample, timestamp_ms: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO market_prices
                (exchange, symbol, timestamp_ms, spot_bid, spot_ask, spot_price,
                 futures_bid, futures_ask, futures_price, maker_fee, taker_fee)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                sample.exchange,
                sample.symbol,
                timestamp_ms,
                sample.spot_bid,
                sample.spot_ask,
                sample.spot_last,
                sample.futures_bid,
                sample.futures_ask,
                sample.futures_last,
                sample.maker_fee,
                sample.taker_fee,
            ],
        )
        .context("insert_market_price failed")?;
        Ok(())
    }

    /// Rows newer than `since_ms`, used for cold-start preload (§4.1).
    pub fn recent_market_prices(&self, since_ms: i64) -> Result<Vec<(String, String, MarketSample)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT exchange, symbol, spot_bid, spot_ask, spot_price,
                    futures_bid, futures_ask, futures_price, maker_fee, taker_fee, timestamp_ms
             FROM market_prices WHERE timestamp_ms >= ?1",
        )?;
        let rows = stmt
            .query_map(params![since_ms], |row| {
                let exchange: String = row.get(0)?;
                let symbol: String = row.get(1)?;
                let ts_ms: i64 = row.get(10)?;
                let sample = MarketSample {
                    exchange: exchange.clone(),
                    symbol: symbol.clone(),
                    spot_bid: row.get(2)?,
                    spot_ask: row.get(3)?,
                    spot_last: row.get(4)?,
                    futures_bid: row.get(5)?,
                    futures_ask: row.get(6)?,
                    futures_last: row.get(7)?,
                    maker_fee: row.get(8)?,
                    taker_fee: row.get(9)?,
                    sampled_at: Some(ms_to_datetime(ts_ms)),
                    ..Default::default()
                };
                Ok((exchange, symbol, sample))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---- orders ---------------------------------------------------------

    pub fn insert_order(&self, order: &Order) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO orders
                (strategy_id, strategy_type, purpose, exchange, symbol, side, order_type,
                 is_futures, price, requested_amount, filled_amount, status, venue_order_id,
                 fee_cost, fee_currency, create_time, update_time)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            params![
                order.strategy_id,
                order.strategy_type.as_str(),
                purpose_str(order.purpose),
                order.exchange,
                order.symbol,
                side_str(order.side),
                order_type_str(order.order_type),
                order.is_futures as i64,
                order.price,
                order.requested_amount,
                order.filled_amount,
                order_status_str(order.status),
                order.venue_order_id,
                order.fee_cost,
                order.fee_currency,
                order.create_time.to_rfc3339(),
                order.update_time.to_rfc3339(),
            ],
        )
        .context("insert_order failed")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_order_status(
        &self,
        id: i64,
        status: OrderStatus,
        filled_amount: f64,
        fee_cost: f64,
        fee_currency: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE orders SET status=?1, filled_amount=?2, fee_cost=?3, fee_currency=?4, update_time=?5 WHERE id=?6",
            params![
                order_status_str(status),
                filled_amount,
                fee_cost,
                fee_currency,
                Utc::now().to_rfc3339(),
                id
            ],
        )
        .context("update_order_status failed")?;
        Ok(())
    }

    pub fn open_orders(&self) -> Result<Vec<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, strategy_id, strategy_type, purpose, exchange, symbol, side, order_type,
                    is_futures, price, requested_amount, filled_amount, status, venue_order_id,
                    fee_cost, fee_currency, create_time, update_time
             FROM orders WHERE status IN ('open','pending','partially_filled')",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_order)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn row_to_order(row: &Row) -> rusqlite::Result<Order> {
        Ok(Order {
            id: Some(row.get(0)?),
            strategy_id: row.get(1)?,
            strategy_type: parse_strategy(&row.get::<_, String>(2)?),
            purpose: parse_purpose(&row.get::<_, String>(3)?),
            exchange: row.get(4)?,
            symbol: row.get(5)?,
            side: parse_side(&row.get::<_, String>(6)?),
            order_type: parse_order_type(&row.get::<_, String>(7)?),
            is_futures: row.get::<_, i64>(8)? != 0,
            price: row.get(9)?,
            requested_amount: row.get(10)?,
            filled_amount: row.get(11)?,
            status: parse_order_status(&row.get::<_, String>(12)?),
            venue_order_id: row.get(13)?,
            fee_cost: row.get(14)?,
            fee_currency: row.get(15)?,
            create_time: parse_ts(&row.get::<_, String>(16)?),
            update_time: parse_ts(&row.get::<_, String>(17)?),
        })
    }

    // ---- positions --------------------------------------------------------

    pub fn insert_position(&self, position: &Position) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO positions
                (opportunity_id, strategy_type, symbol, exchanges, entry_details, position_size,
                 current_pnl, realized_pnl, funding_collected, fees_paid, status, open_time,
                 close_time, trailing_stop_activated, best_price, activation_price, synced_from_exchange)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            params![
                position.opportunity_id,
                position.strategy_type.as_str(),
                position.symbol,
                serde_json::to_string(&position.exchanges).unwrap_or_default(),
                serde_json::to_string(&position.entry_details).unwrap_or_default(),
                position.position_size,
                position.current_pnl,
                position.realized_pnl,
                position.funding_collected,
                position.fees_paid,
                position_status_str(position.status),
                position.open_time.to_rfc3339(),
                position.close_time.map(|t| t.to_rfc3339()),
                position.trailing_stop_activated as i64,
                position.best_price,
                position.activation_price,
                position.synced_from_exchange as i64,
            ],
        )
        .context("insert_position failed")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_position(&self, position: &Position) -> Result<()> {
        let id = position.id.context("update_position requires an id")?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE positions SET
                current_pnl=?1, realized_pnl=?2, funding_collected=?3, fees_paid=?4, status=?5,
                close_time=?6, trailing_stop_activated=?7, best_price=?8, activation_price=?9,
                entry_details=?10
             WHERE id=?11",
            params![
                position.current_pnl,
                position.realized_pnl,
                position.funding_collected,
                position.fees_paid,
                position_status_str(position.status),
                position.close_time.map(|t| t.to_rfc3339()),
                position.trailing_stop_activated as i64,
                position.best_price,
                position.activation_price,
                serde_json::to_string(&position.entry_details).unwrap_or_default(),
                id,
            ],
        )
        .context("update_position failed")?;
        Ok(())
    }

    pub fn open_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, opportunity_id, strategy_type, symbol, exchanges, entry_details,
                    position_size, current_pnl, realized_pnl, funding_collected, fees_paid,
                    status, open_time, close_time, trailing_stop_activated, best_price,
                    activation_price, synced_from_exchange
             FROM positions WHERE status IN ('open','emergency_close_pending')",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_position)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn row_to_position(row: &Row) -> rusqlite::Result<Position> {
        let exchanges: String = row.get(4)?;
        let entry_details: String = row.get(5)?;
        Ok(Position {
            id: Some(row.get(0)?),
            opportunity_id: row.get(1)?,
            strategy_type: parse_strategy(&row.get::<_, String>(2)?),
            symbol: row.get(3)?,
            exchanges: serde_json::from_str(&exchanges).unwrap_or_default(),
            entry_details: serde_json::from_str::<EntryDetails>(&entry_details).unwrap_or_default(),
            position_size: row.get(6)?,
            current_pnl: row.get(7)?,
            realized_pnl: row.get(8)?,
            funding_collected: row.get(9)?,
            fees_paid: row.get(10)?,
            status: parse_position_status(&row.get::<_, String>(11)?),
            open_time: parse_ts(&row.get::<_, String>(12)?),
            close_time: row
                .get::<_, Option<String>>(13)?
                .map(|s| parse_ts(&s)),
            trailing_stop_activated: row.get::<_, i64>(14)? != 0,
            best_price: row.get(15)?,
            activation_price: row.get(16)?,
            synced_from_exchange: row.get::<_, i64>(17)? != 0,
        })
    }

    // ---- risk events --------------------------------------------------------

    pub fn insert_risk_event(&self, event: &RiskEvent) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO risk_events (severity, event_type, description, position_id, is_handled, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                severity_str(event.severity),
                event.event_type,
                event.description,
                event.position_id,
                event.is_handled as i64,
                event.timestamp.to_rfc3339(),
            ],
        )
        .context("insert_risk_event failed")?;
        Ok(conn.last_insert_rowid())
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "buy",
        OrderSide::Sell => "sell",
    }
}

fn parse_side(raw: &str) -> OrderSide {
    if raw == "sell" {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    }
}

fn order_type_str(t: OrderType) -> &'static str {
    match t {
        OrderType::Market => "market",
        OrderType::Limit => "limit",
    }
}

fn parse_order_type(raw: &str) -> OrderType {
    if raw == "limit" {
        OrderType::Limit
    } else {
        OrderType::Market
    }
}

fn purpose_str(p: OrderPurpose) -> &'static str {
    match p {
        OrderPurpose::Open => "open",
        OrderPurpose::Close => "close",
        OrderPurpose::Rollback => "rollback",
    }
}

fn parse_purpose(raw: &str) -> OrderPurpose {
    match raw {
        "close" => OrderPurpose::Close,
        "rollback" => OrderPurpose::Rollback,
        _ => OrderPurpose::Open,
    }
}

fn order_status_str(s: OrderStatus) -> &'static str {
    match s {
        OrderStatus::Pending => "pending",
        OrderStatus::Open => "open",
        OrderStatus::PartiallyFilled => "partially_filled",
        OrderStatus::Filled => "filled",
        OrderStatus::Closed => "closed",
        OrderStatus::Cancelled => "cancelled",
        OrderStatus::Failed => "failed",
        OrderStatus::Unknown => "unknown",
    }
}

fn parse_order_status(raw: &str) -> OrderStatus {
    match raw {
        "pending" => OrderStatus::Pending,
        "open" => OrderStatus::Open,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "filled" => OrderStatus::Filled,
        "closed" => OrderStatus::Closed,
        "cancelled" => OrderStatus::Cancelled,
        "failed" => OrderStatus::Failed,
        _ => OrderStatus::Unknown,
    }
}

fn position_status_str(s: PositionStatus) -> &'static str {
    match s {
        PositionStatus::Open => "open",
        PositionStatus::EmergencyClosePending => "emergency_close_pending",
        PositionStatus::Closed => "closed",
        PositionStatus::Failed => "failed",
    }
}

fn parse_position_status(raw: &str) -> PositionStatus {
    match raw {
        "open" => PositionStatus::Open,
        "emergency_close_pending" => PositionStatus::EmergencyClosePending,
        "failed" => PositionStatus::Failed,
        _ => PositionStatus::Closed,
    }
}

fn severity_str(s: RiskSeverity) -> &'static str {
    match s {
        RiskSeverity::Warning => "warning",
        RiskSeverity::Critical => "critical",
        RiskSeverity::Emergency => "emergency",
    }
}

fn parse_strategy(raw: &str) -> StrategyType {
    match raw {
        "s2a" => StrategyType::S2a,
        "s2b" => StrategyType::S2b,
        "s3" => StrategyType::S3,
        _ => StrategyType::S1,
    }
}

impl FromStr for StrategyType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(parse_strategy(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionMode;

    fn sample_config(category: &str, key: &str, value: &str) -> ConfigEntry {
        ConfigEntry {
            id: None,
            category: category.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            is_hot_reload: true,
            description: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn config_set_default_preserves_operator_write() {
        let db = Db::in_memory().unwrap();
        db.upsert_config(&sample_config("risk", "max_drawdown", "0.2"))
            .unwrap();
        assert!(db.config_exists("risk", "max_drawdown").unwrap());

        // operator already wrote 0.2; a SetDefault-style caller must check
        // existence first and skip the write (exercised in config.rs).
        let entries = db.load_all_config().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, "0.2");
    }

    #[test]
    fn position_round_trip_preserves_entry_details() {
        let db = Db::in_memory().unwrap();
        let position = Position {
            id: None,
            opportunity_id: Some("s1_BTC/USDT_binance_okx".to_string()),
            strategy_type: StrategyType::S1,
            symbol: "BTC/USDT".to_string(),
            exchanges: vec!["binance".to_string(), "okx".to_string()],
            entry_details: EntryDetails {
                long_exchange: Some("binance".to_string()),
                short_exchange: Some("okx".to_string()),
                entry_long_price: Some(50000.0),
                entry_short_price: Some(50010.0),
                ..Default::default()
            },
            position_size: 1000.0,
            current_pnl: 0.0,
            realized_pnl: 0.0,
            funding_collected: 0.0,
            fees_paid: 2.5,
            status: PositionStatus::Open,
            open_time: Utc::now(),
            close_time: None,
            trailing_stop_activated: false,
            best_price: None,
            activation_price: None,
            synced_from_exchange: false,
        };
        let id = db.insert_position(&position).unwrap();
        let loaded = db.open_positions().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, Some(id));
        assert_eq!(
            loaded[0].entry_details.long_exchange.as_deref(),
            Some("binance")
        );
        assert_eq!(loaded[0].entry_details.entry_long_price, Some(50000.0));
        let _ = ExecutionMode::Auto;
    }

    #[test]
    fn order_status_updates_are_visible_in_open_orders() {
        let db = Db::in_memory().unwrap();
        let now = Utc::now();
        let order = Order {
            id: None,
            strategy_id: Some("s1_BTC/USDT_binance_okx".to_string()),
            strategy_type: StrategyType::S1,
            purpose: OrderPurpose::Open,
            exchange: "binance".to_string(),
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            is_futures: true,
            price: None,
            requested_amount: 1000.0,
            filled_amount: 0.0,
            status: OrderStatus::Pending,
            venue_order_id: None,
            fee_cost: 0.0,
            fee_currency: None,
            create_time: now,
            update_time: now,
        };
        let id = db.insert_order(&order).unwrap();
        assert_eq!(db.open_orders().unwrap().len(), 1);
        db.update_order_status(id, OrderStatus::Filled, 1000.0, 0.4, Some("USDT"))
            .unwrap();
        assert_eq!(db.open_orders().unwrap().len(), 0);
    }
}
