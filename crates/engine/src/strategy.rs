//! Entry/exit decision rules for short strategies
//!
//! A [`Strategy`] only decides; fills, fees and balance changes belong to the
//! engine. Every rule treats an undefined indicator value as "do nothing".

use serde::{Deserialize, Serialize};

use crate::indicators::{pair, IndicatorCache};
use crate::position::PositionState;
use crate::types::{Candle, ExitReason, StrategyParams};

/// Entry/exit capability shared by the backtest engine and the live loop
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether a short should be opened at the close of bar `i`
    fn should_enter_short(
        &self,
        candles: &[Candle],
        cache: &IndicatorCache,
        i: usize,
        params: &StrategyParams,
    ) -> bool;

    /// Exit decision for the open `position` on bar `i`
    fn should_exit_short(
        &self,
        candles: &[Candle],
        cache: &IndicatorCache,
        i: usize,
        position: &PositionState,
        params: &StrategyParams,
    ) -> Option<ExitReason>;
}

// ============================================================================
// Trend + multi-filter short
// ============================================================================

/// Shorts a three-bar lower low under a falling SMA, optionally confirmed by
/// falling MACD and signal lines. Exits on take-profit or, when enabled, on a
/// rising stochastic.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrendFilterShort;

impl Strategy for TrendFilterShort {
    fn name(&self) -> &'static str {
        "trend_filter"
    }

    fn should_enter_short(
        &self,
        candles: &[Candle],
        cache: &IndicatorCache,
        i: usize,
        params: &StrategyParams,
    ) -> bool {
        if i < 2 || i >= candles.len() || !params.is_trading_month(&candles[i].time) {
            return false;
        }
        let Some((sma, prev_sma)) = pair(&cache.sma, i) else {
            return false;
        };

        let lower_low =
            candles[i - 2].low <= candles[i - 1].low && candles[i].low < candles[i - 1].low;
        if !lower_low || sma >= prev_sma {
            return false;
        }

        if params.use_macd && !is_falling(&cache.macd, i) {
            return false;
        }
        if params.use_signal && !is_falling(&cache.signal, i) {
            return false;
        }
        true
    }

    fn should_exit_short(
        &self,
        candles: &[Candle],
        cache: &IndicatorCache,
        i: usize,
        position: &PositionState,
        params: &StrategyParams,
    ) -> Option<ExitReason> {
        let candle = candles.get(i)?;
        if candle.low <= position.take_profit_price {
            return Some(ExitReason::TakeProfit);
        }
        if params.use_momentum_exit {
            if let Some((k, prev_k)) = pair(&cache.stoch_k, i) {
                if k > prev_k {
                    return Some(ExitReason::MomentumExit);
                }
            }
        }
        None
    }
}

fn is_falling(series: &[Option<f64>], i: usize) -> bool {
    matches!(pair(series, i), Some((cur, prev)) if cur < prev)
}

// ============================================================================
// Fixed-hold short
// ============================================================================

/// Shorts whenever the close is under the SMA and holds for at most
/// `max_bars_in_trade` bars unless the take-profit distance is reached first.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedHoldShort;

impl Strategy for FixedHoldShort {
    fn name(&self) -> &'static str {
        "fixed_hold"
    }

    fn should_enter_short(
        &self,
        candles: &[Candle],
        cache: &IndicatorCache,
        i: usize,
        params: &StrategyParams,
    ) -> bool {
        let Some(candle) = candles.get(i) else {
            return false;
        };
        if !params.is_trading_month(&candle.time) {
            return false;
        }
        matches!(cache.sma.get(i), Some(Some(sma)) if candle.close < *sma)
    }

    fn should_exit_short(
        &self,
        candles: &[Candle],
        _cache: &IndicatorCache,
        i: usize,
        position: &PositionState,
        params: &StrategyParams,
    ) -> Option<ExitReason> {
        let candle = candles.get(i)?;
        let target = position.entry_price * (1.0 - params.take_profit_pct);
        if candle.close <= target {
            return Some(ExitReason::TakeProfit);
        }
        if params.max_bars_in_trade > 0 && position.bars_held >= params.max_bars_in_trade {
            return Some(ExitReason::Time);
        }
        None
    }
}

// ============================================================================
// Selection
// ============================================================================

/// Strategy variant chosen by configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    TrendFilter,
    FixedHold,
}

impl StrategyKind {
    pub fn build(self) -> Box<dyn Strategy> {
        match self {
            StrategyKind::TrendFilter => Box::new(TrendFilterShort),
            StrategyKind::FixedHold => Box::new(FixedHoldShort),
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::TrendFilter => write!(f, "trend_filter"),
            StrategyKind::FixedHold => write!(f, "fixed_hold"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trend_filter" | "trend" => Ok(StrategyKind::TrendFilter),
            "fixed_hold" | "fixed" => Ok(StrategyKind::FixedHold),
            other => Err(format!("unknown strategy '{other}'")),
        }
    }
}
