//! Types shared by the simulation engine

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

/// A single candlestick (OHLCV), oldest-first within any sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// True when every timestamp is strictly greater than the one before it.
pub fn is_strictly_increasing(candles: &[Candle]) -> bool {
    candles.windows(2).all(|w| w[0].time < w[1].time)
}

/// Side of a simulated fill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    TakeProfit,
    MomentumExit,
    FinalClose,
    Liquidation,
    Time,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::TakeProfit => write!(f, "TakeProfit"),
            ExitReason::MomentumExit => write!(f, "MomentumExit"),
            ExitReason::FinalClose => write!(f, "FinalClose"),
            ExitReason::Liquidation => write!(f, "Liquidation"),
            ExitReason::Time => write!(f, "Time"),
        }
    }
}

/// One exchange risk-limit tier: positions up to `max_notional` may use at
/// most `max_leverage`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeverageTier {
    pub max_notional: f64,
    pub max_leverage: f64,
}

/// Discrete ranges swept by grid search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridRanges {
    pub sma_periods: Vec<usize>,
    pub stoch_periods: Vec<usize>,
    pub use_macd: Vec<bool>,
    pub use_signal: Vec<bool>,
    pub use_momentum_exit: Vec<bool>,
}

impl Default for GridRanges {
    fn default() -> Self {
        Self {
            sma_periods: vec![30, 50, 80],
            stoch_periods: vec![10, 14, 20],
            use_macd: vec![true, false],
            use_signal: vec![true, false],
            use_momentum_exit: vec![true, false],
        }
    }
}

impl GridRanges {
    /// Number of combinations in the Cartesian product
    pub fn size(&self) -> usize {
        self.sma_periods.len()
            * self.stoch_periods.len()
            * self.use_macd.len()
            * self.use_signal.len()
            * self.use_momentum_exit.len()
    }
}

/// Configuration for one backtest pass (and, via `grid`, for grid search)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    pub starting_balance: f64,
    /// Fraction of current balance reserved as margin per entry (0.95 = 95%)
    pub risk_fraction: f64,
    pub margin_rate: f64,
    /// Target leverage; `None` means `1 / margin_rate`
    pub desired_leverage: Option<f64>,
    pub max_leverage: f64,
    pub maintenance_margin_rate: f64,
    pub taker_fee_rate: f64,
    pub spread_bps: f64,
    pub slippage_bps: f64,
    pub random_seed: u64,
    pub take_profit_pct: f64,
    pub start_year: i32,
    pub start_month: u32,

    pub sma_period: usize,
    pub stoch_period: usize,
    pub smooth_k: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub use_macd: bool,
    pub use_signal: bool,
    pub use_momentum_exit: bool,
    /// Holding limit for the fixed-hold strategy
    pub max_bars_in_trade: usize,

    pub leverage_tiers: Vec<LeverageTier>,
    pub grid: GridRanges,
}

/// Fixed take-profit distance below a short entry (0.44%)
pub const FIXED_TAKE_PROFIT_PCT: f64 = 0.0044;

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            starting_balance: 1000.0,
            risk_fraction: 0.95,
            margin_rate: 0.10,
            desired_leverage: Some(3.0),
            max_leverage: 50.0,
            maintenance_margin_rate: 0.004,
            taker_fee_rate: 0.0006,
            spread_bps: 0.0,
            slippage_bps: 0.0,
            random_seed: 1337,
            take_profit_pct: FIXED_TAKE_PROFIT_PCT,
            start_year: 2020,
            start_month: 1,
            sma_period: 50,
            stoch_period: 14,
            smooth_k: 2,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            use_macd: true,
            use_signal: true,
            use_momentum_exit: true,
            max_bars_in_trade: 30,
            leverage_tiers: Vec::new(),
            grid: GridRanges::default(),
        }
    }
}

impl StrategyParams {
    /// Leading bars on which no decision is taken
    pub fn warmup(&self) -> usize {
        self.sma_period
            .max(self.stoch_period)
            .max(self.macd_slow)
            .max(self.macd_signal)
            + 2
    }

    /// Whether `time` falls on or after the configured start year/month
    pub fn is_trading_month(&self, time: &DateTime<Utc>) -> bool {
        time.year() > self.start_year
            || (time.year() == self.start_year && time.month() >= self.start_month)
    }
}

/// A completed short trade. Never mutated after it is appended to a log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub entry_index: usize,
    pub exit_index: usize,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub margin_used: f64,
    pub gross_pnl: f64,
    pub net_pnl: f64,
    pub entry_fee: f64,
    pub exit_fee: f64,
    pub leverage: f64,
    pub liquidation_price: Option<f64>,
    pub balance_after: f64,
    pub reason: ExitReason,
}

impl TradeRecord {
    pub fn fees(&self) -> f64 {
        self.entry_fee + self.exit_fee
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_warmup_uses_longest_period() {
        let params = StrategyParams::default();
        assert_eq!(params.warmup(), 52);

        let params = StrategyParams {
            sma_period: 10,
            stoch_period: 5,
            macd_slow: 6,
            macd_signal: 3,
            ..Default::default()
        };
        assert_eq!(params.warmup(), 12);
    }

    #[test]
    fn test_trading_month_filter() {
        let params = StrategyParams {
            start_year: 2023,
            start_month: 6,
            ..Default::default()
        };
        let before = Utc.with_ymd_and_hms(2023, 5, 31, 23, 59, 0).unwrap();
        let on = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        let later_year = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(!params.is_trading_month(&before));
        assert!(params.is_trading_month(&on));
        assert!(params.is_trading_month(&later_year));
    }

    #[test]
    fn test_default_grid_size() {
        assert_eq!(GridRanges::default().size(), 3 * 3 * 2 * 2 * 2);
    }

    #[test]
    fn test_params_deserialize_with_defaults() {
        let params: StrategyParams =
            serde_json::from_str(r#"{"sma_period": 20, "use_macd": false}"#).unwrap();
        assert_eq!(params.sma_period, 20);
        assert!(!params.use_macd);
        assert_eq!(params.stoch_period, 14);
        assert_eq!(params.desired_leverage, Some(3.0));
    }

    #[test]
    fn test_strictly_increasing() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bar = |minute: i64| Candle {
            time: t0 + chrono::Duration::minutes(minute),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0.0,
        };
        assert!(is_strictly_increasing(&[bar(0), bar(1), bar(2)]));
        assert!(!is_strictly_increasing(&[bar(0), bar(1), bar(1)]));
        assert!(!is_strictly_increasing(&[bar(1), bar(0)]));
        assert!(is_strictly_increasing(&[]));
    }
}
