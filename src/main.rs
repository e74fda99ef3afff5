//! Funding-rate arbitrage engine — process entrypoint.
//!
//! Owns bootstrap (env/config load, tracing init, store construction) and
//! spawns the eight independent loops named across the collector,
//! opportunity monitor, risk manager, order manager and strategy executor.
//! Carries a minimal `axum` status surface; the full operator dashboard is
//! out of scope.

mod accounts;
mod calculator;
mod collector;
mod config;
mod crypto;
mod db;
mod exchange;
mod executor;
mod models;
mod opportunity;
mod order_manager;
mod risk;

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use clap::Parser;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::accounts::ExchangeAccountStore;
use crate::collector::MarketDataCollector;
use crate::config::ConfigStore;
use crate::crypto::Crypto;
use crate::db::Db;
use crate::exchange::{ExchangeDriver, MockDriver, MockQuote, RestDriver};
use crate::executor::StrategyExecutor;
use crate::models::ProcessConfig;
use crate::opportunity::OpportunityMonitor;
use crate::order_manager::OrderManager;
use crate::risk::RiskManager;

/// Startup flags. Anything hot-reloadable lives in the `config` table
/// instead (`src/config.rs`) — these only cover what must be decided once,
/// before the database even opens.
#[derive(Parser, Debug)]
#[command(name = "funding-arb-engine", version, about = "Perpetual-futures funding-rate arbitrage engine")]
struct Cli {
    /// Overrides DATABASE_PATH.
    #[arg(long)]
    db_path: Option<String>,

    /// Overrides DATA_DIR (credential key file lives here).
    #[arg(long)]
    config_path: Option<String>,

    /// Forces simulation mode regardless of ENABLE_TRADING.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

/// Bundles every spawned loop's handle. Aborting on drop means shutdown
/// never leaves a half-stopped background task running past process exit.
struct EngineHandle {
    tasks: Vec<JoinHandle<()>>,
    opportunity: Arc<OpportunityMonitor>,
    collector: Arc<MarketDataCollector>,
    orders: Arc<OrderManager>,
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.opportunity.stop();
        self.collector.stop();
        self.orders.stop();
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[derive(Clone)]
struct ApiState {
    db: Db,
    opportunity: Arc<OpportunityMonitor>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut process_config = ProcessConfig::from_env();
    if let Some(db_path) = cli.db_path {
        process_config.database_path = db_path;
    }
    if let Some(data_dir) = cli.config_path {
        process_config.data_dir = data_dir;
    }
    if cli.dry_run {
        process_config.enable_trading = false;
    }

    info!("🚀 funding-arb-engine starting (trading_enabled={})", process_config.enable_trading);

    let db = Db::open(&process_config.database_path)
        .with_context(|| format!("failed to open database at {}", process_config.database_path))?;

    let crypto = Arc::new(
        Crypto::load_or_generate(&process_config.data_dir)
            .context("failed to load or generate credential encryption key")?,
    );
    let accounts = ExchangeAccountStore::load(db.clone(), crypto)
        .context("failed to load exchange accounts")?;

    let config = ConfigStore::load(db.clone()).context("failed to load config store")?;

    let drivers = build_drivers(&accounts, process_config.enable_trading).await;
    info!("🔌 {} exchange driver(s) wired: {:?}", drivers.len(), drivers.keys().collect::<Vec<_>>());

    let collector = MarketDataCollector::new(db.clone(), drivers.clone(), 5, 300);
    collector.bootstrap().await.context("collector bootstrap failed")?;

    let opportunity = OpportunityMonitor::new(db.clone(), config.clone(), collector.cache(), 10);
    let risk = RiskManager::new(db.clone(), config.clone());
    let orders = OrderManager::new(db.clone(), drivers, process_config.enable_trading);
    let executor = StrategyExecutor::new(db.clone(), config, collector.cache(), risk.clone(), orders.clone());

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    tasks.push(tokio::spawn({
        let collector = collector.clone();
        async move { collector.run_price_loop().await }
    }));
    tasks.push(tokio::spawn({
        let collector = collector.clone();
        async move { collector.run_funding_loop().await }
    }));
    tasks.push(tokio::spawn({
        let opportunity = opportunity.clone();
        async move { opportunity.run().await }
    }));
    tasks.push(tokio::spawn({
        let risk = risk.clone();
        async move { risk.run_monitor_loop().await }
    }));
    tasks.push(tokio::spawn({
        let executor = executor.clone();
        async move { executor.run_admission_loop().await }
    }));
    tasks.push(tokio::spawn({
        let executor = executor.clone();
        async move { executor.run_position_monitor_loop().await }
    }));
    tasks.push(tokio::spawn({
        let executor = executor.clone();
        async move { executor.run_reconciliation_loop().await }
    }));
    tasks.push(tokio::spawn({
        let orders = orders.clone();
        async move { orders.run_sync_loop(10).await }
    }));

    // Bridges the scan broadcast into the executor's admission queue — the
    // only wiring between the two components that isn't a direct call.
    tasks.push(tokio::spawn({
        let mut scans = opportunity.subscribe();
        let executor = executor.clone();
        async move {
            loop {
                match scans.recv().await {
                    Ok(batch) => executor.offer((*batch).clone()).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("opportunity broadcast lagged, skipped {} batches", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }));

    let engine = Arc::new(EngineHandle {
        tasks,
        opportunity: opportunity.clone(),
        collector: collector.clone(),
        orders: orders.clone(),
    });

    let api_state = ApiState { db, opportunity };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .with_state(api_state);

    let listener = TcpListener::bind(&process_config.http_bind)
        .await
        .with_context(|| format!("failed to bind HTTP status surface on {}", process_config.http_bind))?;
    info!("📡 status surface listening on {}", process_config.http_bind);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("status server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 shutdown signal received");
        }
    }

    drop(engine);
    Ok(())
}

/// Builds one `ExchangeDriver` per configured account, falling back to a
/// pair of seeded `MockDriver`s (binance/okx) when no credentials are on
/// file — keeps the engine runnable end-to-end in simulation mode with
/// zero configuration.
async fn build_drivers(accounts: &ExchangeAccountStore, trading_enabled: bool) -> HashMap<String, Arc<dyn ExchangeDriver>> {
    let configured = accounts.all();
    if configured.is_empty() {
        if trading_enabled {
            warn!("⚠️  ENABLE_TRADING=1 but no exchange accounts are configured; falling back to mock drivers");
        }
        return default_mock_drivers();
    }

    let mut drivers: HashMap<String, Arc<dyn ExchangeDriver>> = HashMap::new();
    for account in configured {
        let driver = RestDriver::binance(account.exchange_name.clone());
        if let Err(e) = driver.configure(&account).await {
            warn!("failed to configure driver for {}: {}", account.exchange_name, e);
            continue;
        }
        drivers.insert(account.exchange_name.clone(), Arc::new(driver));
    }
    drivers
}

fn default_mock_drivers() -> HashMap<String, Arc<dyn ExchangeDriver>> {
    let mut drivers: HashMap<String, Arc<dyn ExchangeDriver>> = HashMap::new();

    let binance = MockDriver::new("binance");
    binance.set_quote("BTC/USDT", MockQuote {
        spot_bid: 49_990.0,
        spot_ask: 50_000.0,
        futures_bid: 50_010.0,
        futures_ask: 50_020.0,
        funding_rate: 0.0003,
        next_funding_time_ms: chrono::Utc::now().timestamp_millis() + 3_600_000,
        interval_ms: 8 * 3_600_000,
        maker_fee: 0.0002,
        taker_fee: 0.0004,
        depth: 100_000.0,
    });
    drivers.insert("binance".to_string(), Arc::new(binance));

    let okx = MockDriver::new("okx");
    okx.set_quote("BTC/USDT", MockQuote {
        spot_bid: 49_980.0,
        spot_ask: 49_995.0,
        futures_bid: 50_060.0,
        futures_ask: 50_075.0,
        funding_rate: 0.0009,
        next_funding_time_ms: chrono::Utc::now().timestamp_millis() + 3_600_000,
        interval_ms: 8 * 3_600_000,
        maker_fee: 0.0002,
        taker_fee: 0.0005,
        depth: 80_000.0,
    });
    drivers.insert("okx".to_string(), Arc::new(okx));

    drivers
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let open_positions = state.db.open_positions().map(|p| p.len()).unwrap_or(0);
    let opportunities = state.opportunity.current().len();
    Json(json!({
        "open_positions": open_positions,
        "opportunities": opportunities,
    }))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "funding_arb_engine=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
