//! Risk manager (§4.5): gates new entries with an ordered battery of
//! pre-trade checks, then independently polices open positions for loss
//! thresholds on a fixed cadence. Grounded on
//! `original_source/core/risk_manager.py`; the fractional-Kelly/VaR
//! machinery the teacher carried for its prediction-market book has no
//! counterpart here and is not kept.

use crate::config::ConfigStore;
use crate::db::Db;
use crate::models::{Opportunity, Position, PositionStatus, RiskEvent, RiskSeverity};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::interval;
use tracing::{error, warn};

#[derive(Debug, Error, PartialEq)]
pub enum RiskRejection {
    #[error("aggregate drawdown {loss_pct:.4} exceeds max_drawdown {max_drawdown:.4}")]
    DrawdownExceeded { loss_pct: f64, max_drawdown: f64 },
    #[error("no available capital (total_capital·max_capital_usage already committed)")]
    NoAvailableCapital,
    #[error("open position count {open} at or above max_positions {max}")]
    TooManyOpenPositions { open: usize, max: i64 },
    #[error("symbol {symbol} already has {open} open positions (limit {max})")]
    TooManyOpenPositionsForSymbol { symbol: String, open: usize, max: i64 },
    #[error("S1 price deviation {price_diff_pct:.4} exceeds threshold {threshold:.4}")]
    PriceDeviationExceeded { price_diff_pct: f64, threshold: f64 },
}

/// Outcome of a pre-trade check: either an adjusted size to trade, or a
/// rejection reason.
pub struct RiskDecision {
    pub passed: bool,
    pub reason: Option<RiskRejection>,
    pub adjusted_position_size: f64,
}

impl RiskDecision {
    fn reject(reason: RiskRejection) -> Self {
        Self { passed: false, reason: Some(reason), adjusted_position_size: 0.0 }
    }

    fn accept(size: f64) -> Self {
        Self { passed: true, reason: None, adjusted_position_size: size }
    }
}

pub struct RiskManager {
    db: Db,
    config: Arc<ConfigStore>,
}

impl RiskManager {
    pub fn new(db: Db, config: Arc<ConfigStore>) -> Arc<Self> {
        Arc::new(Self { db, config })
    }

    /// Pre-trade gate, evaluated in the §4.5 order: first failure wins.
    pub fn evaluate_entry(&self, opportunity: &Opportunity, open_positions: &[Position]) -> RiskDecision {
        let total_capital = self.config.get_f64("global", "total_capital", 100_000.0);
        let max_capital_usage = self.config.get_f64("global", "max_capital_usage", 0.8);
        let max_drawdown = self.config.get_f64("risk", "max_drawdown", 0.2);
        let max_position_size_per_trade = self.config.get_f64("risk", "max_position_size_per_trade", 5_000.0);
        let max_positions_global = self.config.get_i64("global", "max_positions", 20);
        let price_deviation_threshold = self.config.get_f64("risk", "price_deviation_threshold", 0.02);
        let dynamic_enabled = self.config.get_bool("risk", "dynamic_position_enabled", true);

        // 1. Aggregate drawdown.
        let unrealized: f64 = open_positions.iter().map(|p| p.current_pnl).sum();
        if unrealized < 0.0 {
            let loss_pct = -unrealized / total_capital.max(1.0);
            if loss_pct > max_drawdown {
                return RiskDecision::reject(RiskRejection::DrawdownExceeded { loss_pct, max_drawdown });
            }
        }

        // 2. Clamp to max_position_size_per_trade.
        let mut size = opportunity.position_size.min(max_position_size_per_trade);

        // 3. Available capital.
        let committed: f64 = open_positions.iter().map(|p| p.position_size).sum();
        let available = total_capital * max_capital_usage - committed;
        if available <= 0.0 {
            return RiskDecision::reject(RiskRejection::NoAvailableCapital);
        }
        size = size.min(available);

        // 4. Position-count limits (global and per-symbol).
        if open_positions.len() as i64 >= max_positions_global {
            return RiskDecision::reject(RiskRejection::TooManyOpenPositions {
                open: open_positions.len(),
                max: max_positions_global,
            });
        }
        if let Some(pair_config) = self.config.pair_config(&opportunity.symbol, opportunity.exchanges.first().map(String::as_str).unwrap_or("")) {
            if let Some(max_for_symbol) = pair_config.max_positions {
                let open_for_symbol = open_positions.iter().filter(|p| p.symbol == opportunity.symbol).count();
                if open_for_symbol as i64 >= max_for_symbol {
                    return RiskDecision::reject(RiskRejection::TooManyOpenPositionsForSymbol {
                        symbol: opportunity.symbol.clone(),
                        open: open_for_symbol,
                        max: max_for_symbol,
                    });
                }
            }
        }

        // 5. S1 price-deviation check, computed from the hedge leg prices
        // the scanner stashed in entry_details.
        if matches!(opportunity.strategy, crate::models::StrategyType::S1) {
            if let (Some(long), Some(short)) = (
                opportunity.entry_details.entry_long_price,
                opportunity.entry_details.entry_short_price,
            ) {
                let price_diff_pct = (long - short).abs() / long.max(1e-9);
                if price_diff_pct > price_deviation_threshold {
                    return RiskDecision::reject(RiskRejection::PriceDeviationExceeded {
                        price_diff_pct,
                        threshold: price_deviation_threshold,
                    });
                }
            }
        }

        // 6. Dynamic score-based sizing.
        if dynamic_enabled {
            let multiplier = if opportunity.score >= 85.0 {
                self.config.get_f64("risk", "high_score_multiplier", 1.5)
            } else if opportunity.score >= 60.0 {
                self.config.get_f64("risk", "medium_score_multiplier", 1.0)
            } else {
                self.config.get_f64("risk", "low_score_multiplier", 0.5)
            };
            size = (size * multiplier).min(available);
        }

        if size <= 0.0 {
            return RiskDecision::reject(RiskRejection::NoAvailableCapital);
        }

        RiskDecision::accept(size)
    }

    /// Ambient check: warns (does not block) when a funding rate implies an
    /// implausible annualized yield.
    pub fn check_abnormal_funding_rate(&self, exchange: &str, symbol: &str, rate: f64) {
        let ceiling = self.config.get_f64("risk", "abnormal_funding_rate", 0.01);
        if rate.abs() > ceiling {
            warn!(
                "⚠️ abnormal funding rate on {}/{}: {:.6} exceeds ceiling {:.6}",
                exchange, symbol, rate, ceiling
            );
        }
    }

    /// Ambient check: warns when a spot/futures spread looks too wide to be
    /// a genuine funding arbitrage rather than a stale quote.
    pub fn check_abnormal_price_deviation(&self, exchange: &str, symbol: &str, deviation_pct: f64) {
        let ceiling = self.config.get_f64("risk", "price_deviation_threshold", 0.02);
        if deviation_pct.abs() > ceiling {
            warn!(
                "⚠️ abnormal price deviation on {}/{}: {:.4} exceeds ceiling {:.4}",
                exchange, symbol, deviation_pct, ceiling
            );
        }
    }

    /// The 30s monitoring loop (§4.5). For each open position, computes
    /// `pnl_pct` and emits warning/critical/emergency events; emergency
    /// additionally flips the position to `emergency_close_pending`.
    pub async fn run_monitor_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            if let Err(e) = self.monitor_tick() {
                error!("risk monitor tick failed: {}", e);
            }
        }
    }

    fn monitor_tick(&self) -> anyhow::Result<()> {
        let warning_threshold = self.config.get_f64("risk", "warning_threshold", 0.05);
        let critical_threshold = self.config.get_f64("risk", "critical_threshold", 0.10);
        let emergency_threshold = self.config.get_f64("risk", "emergency_threshold", 0.15);

        for mut position in self.db.open_positions()? {
            let pnl_pct = position.pnl_pct();
            if pnl_pct >= -warning_threshold {
                continue;
            }

            let (severity, event_type) = if pnl_pct < -emergency_threshold {
                (RiskSeverity::Emergency, "emergency_drawdown")
            } else if pnl_pct < -critical_threshold {
                (RiskSeverity::Critical, "critical_drawdown")
            } else {
                (RiskSeverity::Warning, "warning_drawdown")
            };

            let event = RiskEvent::new(
                severity,
                event_type,
                format!(
                    "position {} ({}/{}) pnl_pct={:.4}",
                    position.id.unwrap_or(0),
                    position.symbol,
                    position.strategy_type,
                    pnl_pct
                ),
            )
            .with_position(position.id.unwrap_or(0));
            self.db.insert_risk_event(&event)?;

            if severity == RiskSeverity::Emergency && position.status == PositionStatus::Open {
                position.status = PositionStatus::EmergencyClosePending;
                self.db.update_position(&position)?;
                warn!(
                    "🚨 position {} flipped to emergency_close_pending (pnl_pct={:.4})",
                    position.id.unwrap_or(0),
                    pnl_pct
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryDetails, ExecutionMode, RiskLevel, StrategyType};
    use chrono::Utc;

    fn opportunity(symbol: &str, size: f64, score: f64) -> Opportunity {
        Opportunity {
            id: format!("s2a_{}_binance", symbol),
            strategy: StrategyType::S2a,
            execution_mode: ExecutionMode::Auto,
            risk_level: RiskLevel::Low,
            score,
            symbol: symbol.to_string(),
            exchanges: vec!["binance".to_string()],
            funding_rate: Some(0.001),
            basis: None,
            position_size: size,
            expected_return_per_period: 5.0,
            expected_return_pct: 0.5,
            annualized_return_pct: 20.0,
            entry_details: EntryDetails::default(),
            detected_at: Utc::now(),
        }
    }

    fn manager() -> Arc<RiskManager> {
        let db = Db::in_memory().unwrap();
        let config = ConfigStore::load(db.clone()).unwrap();
        RiskManager::new(db, config)
    }

    #[test]
    fn rejects_when_drawdown_exceeds_threshold() {
        let manager = manager();
        manager.config.set("global", "total_capital", "10000", true).unwrap();
        manager.config.set("risk", "max_drawdown", "0.1", true).unwrap();
        let open = vec![Position {
            id: Some(1),
            opportunity_id: None,
            strategy_type: StrategyType::S1,
            symbol: "BTC/USDT".to_string(),
            exchanges: vec!["binance".to_string()],
            entry_details: EntryDetails::default(),
            position_size: 5000.0,
            current_pnl: -1500.0,
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
        }];
        let decision = manager.evaluate_entry(&opportunity("ETH/USDT", 1000.0, 70.0), &open);
        assert!(!decision.passed);
        assert_eq!(
            decision.reason,
            Some(RiskRejection::DrawdownExceeded { loss_pct: 0.15, max_drawdown: 0.1 })
        );
    }

    #[test]
    fn clamps_size_to_available_capital() {
        let manager = manager();
        manager.config.set("global", "total_capital", "1000", true).unwrap();
        manager.config.set("global", "max_capital_usage", "0.5", true).unwrap();
        manager.config.set("risk", "dynamic_position_enabled", "false", true).unwrap();
        let decision = manager.evaluate_entry(&opportunity("ETH/USDT", 10_000.0, 70.0), &[]);
        assert!(decision.passed);
        assert!(decision.adjusted_position_size <= 500.0);
    }

    #[test]
    fn monitor_tick_flips_emergency_position() {
        let db = Db::in_memory().unwrap();
        let config = ConfigStore::load(db.clone()).unwrap();
        let manager = RiskManager::new(db.clone(), config);
        let position = Position {
            id: None,
            opportunity_id: None,
            strategy_type: StrategyType::S1,
            symbol: "BTC/USDT".to_string(),
            exchanges: vec!["binance".to_string(), "okx".to_string()],
            entry_details: EntryDetails::default(),
            position_size: 10_000.0,
            current_pnl: -1_550.0,
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
        db.insert_position(&position).unwrap();

        manager.monitor_tick().unwrap();

        let reloaded = db.open_positions().unwrap();
        assert_eq!(reloaded[0].status, PositionStatus::EmergencyClosePending);
    }
}
