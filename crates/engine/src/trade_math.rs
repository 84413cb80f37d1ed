//! Exchange mechanics for a linear perpetual short
//!
//! Fee, leverage, liquidation and fill-price models. Everything here is a pure
//! function of its inputs; the only randomness comes from the caller-supplied
//! generator, so a seeded generator reproduces identical fills.

use rand::Rng;

use crate::types::{Direction, LeverageTier, StrategyParams};

const BPS_DIVISOR: f64 = 10_000.0;

/// Taker fee on a trade of `trade_value` quote currency
pub fn fee(trade_value: f64, params: &StrategyParams) -> f64 {
    trade_value * params.taker_fee_rate.max(0.0)
}

/// Leverage applied to a new position reserving `margin_used`.
///
/// Starts from the desired leverage (or `1 / margin_rate` when unset), caps it
/// by `max_leverage` and by the margin-rate ceiling, then by the exchange
/// tier table if one is configured. Never below 1.
pub fn resolve_leverage(margin_used: f64, params: &StrategyParams) -> f64 {
    if margin_used <= 0.0 {
        return 1.0;
    }

    let implied_by_margin = (params.margin_rate > 0.0).then(|| 1.0 / params.margin_rate);
    let desired = params
        .desired_leverage
        .filter(|l| *l > 0.0)
        .or(implied_by_margin)
        .unwrap_or(1.0);
    let max_by_config = if params.max_leverage > 0.0 {
        params.max_leverage
    } else {
        desired
    };

    let mut leverage = desired.min(max_by_config);
    if let Some(ceiling) = implied_by_margin {
        leverage = leverage.min(ceiling);
    }
    leverage = clamp_to_tiers(margin_used, leverage.max(1.0), &params.leverage_tiers);
    leverage.max(1.0)
}

/// Lower `leverage` until the resulting notional fits the tier that allows it
fn clamp_to_tiers(margin_used: f64, mut leverage: f64, tiers: &[LeverageTier]) -> f64 {
    if tiers.is_empty() {
        return leverage;
    }
    let mut sorted = tiers.to_vec();
    sorted.sort_by(|a, b| a.max_notional.total_cmp(&b.max_notional));

    loop {
        let notional = margin_used * leverage;
        let tier = sorted
            .iter()
            .find(|t| notional <= t.max_notional)
            .or(sorted.last());
        let allowed = tier.map_or(leverage, |t| t.max_leverage.max(1.0));
        if leverage <= allowed || leverage <= 1.0 {
            return leverage;
        }
        leverage = allowed;
    }
}

/// Price at which a short opened at `entry_price` is liquidated.
/// Floored at zero.
pub fn short_liquidation_price(entry_price: f64, leverage: f64, params: &StrategyParams) -> f64 {
    let maintenance = params.maintenance_margin_rate.max(0.0);
    let taker_fee = params.taker_fee_rate.max(0.0);
    let leverage = leverage.max(1e-9);
    (entry_price * (1.0 + 1.0 / leverage - maintenance + taker_fee)).max(0.0)
}

/// Fill price for an order at `mid_price`.
///
/// Adds the spread (`spread_bps` of mid) and a half-normal slippage sample (mean
/// `slippage_bps`, sigma `slippage_bps / 2`, Box-Muller from two uniforms) for
/// long fills and subtracts them for short fills. No random draw happens when
/// slippage is zero.
pub fn simulate_fill_price<R: Rng + ?Sized>(
    direction: Direction,
    mid_price: f64,
    params: &StrategyParams,
    rng: &mut R,
) -> f64 {
    let spread = mid_price * (params.spread_bps / BPS_DIVISOR);

    let slippage = if params.slippage_bps > 0.0 {
        let u1 = 1.0 - rng.gen::<f64>();
        let u2 = 1.0 - rng.gen::<f64>();
        let standard_normal = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).sin();
        let mean = params.slippage_bps;
        let std_dev = params.slippage_bps / 2.0;
        let sampled_bps = (mean + standard_normal * std_dev).abs();
        mid_price * (sampled_bps / BPS_DIVISOR)
    } else {
        0.0
    };

    match direction {
        Direction::Long => mid_price + spread + slippage,
        Direction::Short => mid_price - spread - slippage,
    }
}

/// Take-profit target for a short, below entry
pub fn take_profit_price(entry_price: f64, params: &StrategyParams) -> f64 {
    entry_price * (1.0 - params.take_profit_pct)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_fee_ignores_negative_rate() {
        let params = StrategyParams::default();
        assert!(approx(fee(1000.0, &params), 0.6));

        let params = StrategyParams {
            taker_fee_rate: -0.01,
            ..Default::default()
        };
        assert_eq!(fee(1000.0, &params), 0.0);
    }

    #[test]
    fn test_leverage_non_positive_margin() {
        let params = StrategyParams::default();
        assert_eq!(resolve_leverage(0.0, &params), 1.0);
        assert_eq!(resolve_leverage(-5.0, &params), 1.0);
    }

    #[test]
    fn test_leverage_caps() {
        // desired 3x, ceiling 10x from 10% margin, max 50x
        assert_eq!(resolve_leverage(100.0, &StrategyParams::default()), 3.0);

        // unset desired falls back to 1 / margin rate
        let params = StrategyParams {
            desired_leverage: None,
            margin_rate: 0.05,
            ..Default::default()
        };
        assert!(approx(resolve_leverage(100.0, &params), 20.0));

        // capped by max leverage
        let params = StrategyParams {
            desired_leverage: Some(40.0),
            margin_rate: 0.01,
            max_leverage: 25.0,
            ..Default::default()
        };
        assert_eq!(resolve_leverage(100.0, &params), 25.0);

        // capped by margin-rate ceiling
        let params = StrategyParams {
            desired_leverage: Some(40.0),
            margin_rate: 0.2,
            ..Default::default()
        };
        assert!(approx(resolve_leverage(100.0, &params), 5.0));

        // floored at 1
        let params = StrategyParams {
            desired_leverage: Some(0.5),
            ..Default::default()
        };
        assert_eq!(resolve_leverage(100.0, &params), 1.0);
    }

    #[test]
    fn test_leverage_never_increases_with_tighter_margin() {
        let mut previous = f64::INFINITY;
        for margin_rate in [0.01, 0.02, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0] {
            let params = StrategyParams {
                desired_leverage: Some(30.0),
                margin_rate,
                ..Default::default()
            };
            let leverage = resolve_leverage(250.0, &params);
            assert!(leverage >= 1.0);
            assert!(leverage <= previous, "{leverage} > {previous} at rate {margin_rate}");
            previous = leverage;
        }
    }

    #[test]
    fn test_leverage_tiers_clamp_large_notional() {
        let tiers = vec![
            LeverageTier { max_notional: 10_000.0, max_leverage: 10.0 },
            LeverageTier { max_notional: 50_000.0, max_leverage: 5.0 },
            LeverageTier { max_notional: 200_000.0, max_leverage: 2.0 },
        ];
        let params = StrategyParams {
            desired_leverage: Some(10.0),
            leverage_tiers: tiers,
            ..Default::default()
        };
        // 500 * 10 = 5k fits the first tier
        assert_eq!(resolve_leverage(500.0, &params), 10.0);
        // 8000 * 10 = 80k -> tier 3 allows 2x -> 16k -> tier 2 allows 5x, 2 <= 5 so stays 2
        assert_eq!(resolve_leverage(8000.0, &params), 2.0);
        // above every threshold uses the last tier
        assert_eq!(resolve_leverage(1_000_000.0, &params), 2.0);
    }

    #[test]
    fn test_short_liquidation_price() {
        let params = StrategyParams::default();
        let liq = short_liquidation_price(100.0, 3.0, &params);
        assert!(approx(liq, 100.0 * (1.0 + 1.0 / 3.0 - 0.004 + 0.0006)));
        assert!(liq > 100.0);

        let params = StrategyParams {
            maintenance_margin_rate: 5.0,
            ..Default::default()
        };
        assert_eq!(short_liquidation_price(100.0, 1.0, &params), 0.0);
    }

    #[test]
    fn test_fill_spread_direction() {
        let params = StrategyParams {
            spread_bps: 10.0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert!(approx(simulate_fill_price(Direction::Long, 100.0, &params, &mut rng), 100.1));
        assert!(approx(simulate_fill_price(Direction::Short, 100.0, &params, &mut rng), 99.9));
    }

    #[test]
    fn test_fill_slippage_is_adverse_and_reproducible() {
        let params = StrategyParams {
            slippage_bps: 5.0,
            ..Default::default()
        };
        let mut a = StdRng::seed_from_u64(params.random_seed);
        let mut b = StdRng::seed_from_u64(params.random_seed);
        for _ in 0..100 {
            let short_a = simulate_fill_price(Direction::Short, 50.0, &params, &mut a);
            let short_b = simulate_fill_price(Direction::Short, 50.0, &params, &mut b);
            assert_eq!(short_a, short_b);
            assert!(short_a <= 50.0);

            let long_a = simulate_fill_price(Direction::Long, 50.0, &params, &mut a);
            let long_b = simulate_fill_price(Direction::Long, 50.0, &params, &mut b);
            assert_eq!(long_a, long_b);
            assert!(long_a >= 50.0);
        }
    }

    #[test]
    fn test_take_profit_below_entry() {
        let params = StrategyParams::default();
        assert!(approx(take_profit_price(100.0, &params), 99.56));
    }
}
