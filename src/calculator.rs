//! Pure fee/slippage/profit/score formulas shared by every strategy in the
//! opportunity monitor. Bit-for-bit port of `utils/calculator.py`, with
//! the funding-frequency resolver generalized per `DESIGN.md`'s Open
//! Question 1 decision (each venue's periods are resolved independently
//! rather than assumed 8h for both legs of a cross-venue pair).

const DEFAULT_FUNDING_INTERVAL_MS: i64 = 8 * 3_600_000;
const MIN_RESOLVABLE_GAP_HOURS: f64 = 1.0;
const MAX_RESOLVABLE_GAP_HOURS: f64 = 24.0;

/// Resolves funding frequency for one venue/symbol per the precedence in
/// §4.2: (i) venue-reported interval, (ii) delta between the two most
/// recent settlement timestamps if `1h <= delta <= 24h`, (iii) 8h default.
/// Returns `(hours_per_period, periods_per_day)`.
pub fn resolve_funding_periods(
    venue_interval_ms: Option<i64>,
    recent_settlement_timestamps_ms: &[i64],
) -> (f64, f64) {
    if let Some(interval_ms) = venue_interval_ms.filter(|&ms| ms > 0) {
        let hours = interval_ms as f64 / 3_600_000.0;
        return (hours, 24.0 / hours);
    }

    if recent_settlement_timestamps_ms.len() >= 2 {
        let mut sorted = recent_settlement_timestamps_ms.to_vec();
        sorted.sort_unstable();
        let last_two = &sorted[sorted.len() - 2..];
        let delta_hours = (last_two[1] - last_two[0]) as f64 / 3_600_000.0;
        if (MIN_RESOLVABLE_GAP_HOURS..=MAX_RESOLVABLE_GAP_HOURS).contains(&delta_hours) {
            return (delta_hours, 24.0 / delta_hours);
        }
    }

    let hours = DEFAULT_FUNDING_INTERVAL_MS as f64 / 3_600_000.0;
    (hours, 24.0 / hours)
}

/// Slippage estimate for one leg, per §4.2: free below 10% of depth, 1bp
/// up to 50%, 5bp beyond.
pub fn estimate_slippage(notional: f64, depth: f64) -> f64 {
    if depth <= 0.0 {
        return notional * 0.0005;
    }
    if notional < depth * 0.1 {
        0.0
    } else if notional < depth * 0.5 {
        notional * 0.0001
    } else {
        notional * 0.0005
    }
}

/// S1 cross-exchange funding arbitrage: expected net profit per period.
pub struct S1Inputs {
    pub notional: f64,
    pub rate_long: f64,
    pub rate_short: f64,
    pub taker_open_long: f64,
    pub taker_open_short: f64,
    pub maker_close_long: f64,
    pub maker_close_short: f64,
    pub slippage_long: f64,
    pub slippage_short: f64,
}

pub fn s1_net_profit(inputs: &S1Inputs) -> f64 {
    let funding_income = inputs.notional * (inputs.rate_short - inputs.rate_long);
    let fees = inputs.notional * (inputs.taker_open_long + inputs.taker_open_short
        + inputs.maker_close_long + inputs.maker_close_short);
    funding_income - fees - inputs.slippage_long - inputs.slippage_short
}

/// S2A spot-vs-perp funding capture: expected net profit per period.
pub struct S2aInputs {
    pub notional: f64,
    pub rate: f64,
    pub taker_open_spot: f64,
    pub taker_open_fut: f64,
    pub maker_close_spot: f64,
    pub maker_close_fut: f64,
}

pub fn s2a_net_profit(inputs: &S2aInputs) -> f64 {
    let income = inputs.notional * inputs.rate;
    let fees = inputs.notional
        * (inputs.taker_open_spot + inputs.taker_open_fut + inputs.maker_close_spot + inputs.maker_close_fut);
    income - fees
}

/// S2B basis arbitrage over an estimated holding horizon.
pub struct S2bInputs {
    pub notional: f64,
    pub basis: f64,
    pub rate: f64,
    pub periods: f64,
    pub taker_open_spot: f64,
    pub taker_open_fut: f64,
    pub maker_close_spot: f64,
    pub maker_close_fut: f64,
}

pub fn s2b_net_profit(inputs: &S2bInputs) -> f64 {
    let basis_income = inputs.notional * inputs.basis;
    let funding_income = inputs.notional * inputs.rate * inputs.periods;
    let fees = inputs.notional
        * (inputs.taker_open_spot + inputs.taker_open_fut + inputs.maker_close_spot + inputs.maker_close_fut);
    basis_income + funding_income - fees
}

/// S3 directional funding ride: expected net return over the assumed 7-day
/// hold.
pub fn s3_expected_return(rate: f64, periods_per_day: f64, taker_fee: f64, maker_fee: f64) -> f64 {
    rate.abs() * periods_per_day * 7.0 - (taker_fee + maker_fee)
}

/// Composite 0-100 opportunity score (§4.2). `net` is the per-period net
/// return fraction, `risk` is the price-discrepancy or basis magnitude
/// used as the risk penalty input, `bonus` is the annualised rate.
/// Returns 0 when `net` is not positive.
pub fn calculate_score(net: f64, risk: f64, bonus: f64) -> f64 {
    if net <= 0.0 {
        return 0.0;
    }
    let profit_score = (10.0 + 15.0 * (net * 1e4).log10()).min(50.0).max(0.0);
    let risk_score = (30.0 - risk * 1000.0).max(0.0);
    let bonus_score = (bonus / 10.0).min(20.0).max(0.0);
    profit_score + risk_score + bonus_score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn funding_periods_prefer_venue_reported_interval() {
        let (hours, periods) = resolve_funding_periods(Some(4 * 3_600_000), &[]);
        assert_eq!(hours, 4.0);
        assert_eq!(periods, 6.0);
    }

    #[test]
    fn funding_periods_fall_back_to_settlement_delta() {
        let now = 1_700_000_000_000i64;
        let (hours, _) = resolve_funding_periods(None, &[now, now + 8 * 3_600_000]);
        assert_eq!(hours, 8.0);
    }

    #[test]
    fn funding_periods_reject_out_of_range_delta() {
        let now = 1_700_000_000_000i64;
        let (hours, _) = resolve_funding_periods(None, &[now, now + 25 * 3_600_000]);
        assert_eq!(hours, 8.0); // falls back to default, 25h is out of [1,24]
    }

    #[test]
    fn slippage_tiers_match_depth_thresholds() {
        assert_eq!(estimate_slippage(500.0, 10_000.0), 0.0); // < 10%
        assert_eq!(estimate_slippage(4_000.0, 10_000.0), 4_000.0 * 0.0001); // < 50%
        assert_eq!(estimate_slippage(6_000.0, 10_000.0), 6_000.0 * 0.0005); // >= 50%
    }

    #[test]
    fn s2a_scenario_from_seed_data_is_unprofitable_at_original_fees() {
        // §8 scenario 1, first leg: maker=taker=0.0004
        let inputs = S2aInputs {
            notional: 1000.0,
            rate: 0.0008,
            taker_open_spot: 0.0004,
            taker_open_fut: 0.0004,
            maker_close_spot: 0.0004,
            maker_close_fut: 0.0004,
        };
        let net = s2a_net_profit(&inputs);
        assert!((net - (-0.8)).abs() < 1e-9);
    }

    #[test]
    fn s2a_scenario_from_seed_data_is_profitable_at_lower_fees() {
        let inputs = S2aInputs {
            notional: 1000.0,
            rate: 0.0008,
            taker_open_spot: 0.0001,
            taker_open_fut: 0.0002,
            maker_close_spot: 0.0001,
            maker_close_fut: 0.0001,
        };
        let net = s2a_net_profit(&inputs);
        assert!((net - 0.2).abs() < 1e-9);
    }

    #[test]
    fn score_is_zero_for_nonpositive_net() {
        assert_eq!(calculate_score(0.0, 0.01, 5.0), 0.0);
        assert_eq!(calculate_score(-0.001, 0.01, 5.0), 0.0);
    }

    #[test]
    fn score_increases_with_net_profit() {
        let low = calculate_score(0.0005, 0.01, 5.0);
        let high = calculate_score(0.002, 0.01, 5.0);
        assert!(high > low);
    }
}
