//! Indicator series aligned index-for-index with a candle sequence
//!
//! Every series has the same length as its input. `None` marks bars where the
//! indicator has not accumulated enough history; callers must treat it as
//! "cannot decide" rather than as zero.

use crate::types::{Candle, StrategyParams};
use ta::indicators::{ExponentialMovingAverage, Maximum, Minimum};
use ta::Next;

/// An indicator value per bar, `None` during warm-up
pub type Series = Vec<Option<f64>>;

// ============================================================================
// Moving averages
// ============================================================================

/// Simple rolling mean over `period` points.
///
/// Keeps a running sum (add newest, drop the one leaving the window) so a
/// full pass is O(n) regardless of the period.
pub fn moving_average(series: &[f64], period: usize) -> Series {
    let mut out = vec![None; series.len()];
    if period == 0 {
        return out;
    }

    let mut sum = 0.0;
    for (i, &value) in series.iter().enumerate() {
        sum += value;
        if i >= period {
            sum -= series[i - period];
        }
        if i + 1 >= period {
            out[i] = Some(sum / period as f64);
        }
    }
    out
}

/// Exponential moving average with `k = 2 / (period + 1)`, seeded with the
/// first element, so every index is defined.
pub fn exponential_moving_average(series: &[f64], period: usize) -> Series {
    let Ok(mut ema) = ExponentialMovingAverage::new(period) else {
        return vec![None; series.len()];
    };
    series.iter().map(|&value| Some(ema.next(value))).collect()
}

/// EMA over a series that may contain undefined points. Undefined inputs
/// produce undefined outputs and do not advance the average.
fn exponential_moving_average_sparse(series: &[Option<f64>], period: usize) -> Series {
    let Ok(mut ema) = ExponentialMovingAverage::new(period) else {
        return vec![None; series.len()];
    };
    series
        .iter()
        .map(|value| value.map(|v| ema.next(v)))
        .collect()
}

// ============================================================================
// Oscillators
// ============================================================================

/// Stochastic %K centered on zero.
///
/// Raw %K is `100 * (close - lowest_low) / (highest_high - lowest_low)` over the
/// trailing `period` bars (0 for a flat range). The output averages the
/// trailing `smooth_k` raw values that are defined and subtracts 50.
pub fn centered_stochastic_k(candles: &[Candle], period: usize, smooth_k: usize) -> Series {
    let n = candles.len();
    let (Ok(mut highest), Ok(mut lowest)) = (Maximum::new(period), Minimum::new(period)) else {
        return vec![None; n];
    };
    if smooth_k == 0 {
        return vec![None; n];
    }

    let mut raw: Series = Vec::with_capacity(n);
    for (i, candle) in candles.iter().enumerate() {
        let highest_high = highest.next(candle.high);
        let lowest_low = lowest.next(candle.low);
        if i + 1 < period {
            raw.push(None);
            continue;
        }
        let range = highest_high - lowest_low;
        let value = if range.abs() < 1e-12 {
            0.0
        } else {
            100.0 * (candle.close - lowest_low) / range
        };
        raw.push(Some(value));
    }

    let mut out = vec![None; n];
    let mut sum = 0.0;
    let mut defined = 0usize;
    for i in 0..n {
        if let Some(v) = raw[i] {
            sum += v;
            defined += 1;
        }
        if i >= smooth_k {
            if let Some(v) = raw[i - smooth_k] {
                sum -= v;
                defined -= 1;
            }
        }
        if defined > 0 {
            out[i] = Some(sum / defined as f64 - 50.0);
        }
    }
    out
}

/// MACD line: `EMA(close, fast) - EMA(close, slow)`
pub fn macd(candles: &[Candle], fast: usize, slow: usize) -> Series {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let fast_ema = exponential_moving_average(&closes, fast);
    let slow_ema = exponential_moving_average(&closes, slow);
    fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect()
}

/// Signal line: EMA of the MACD line
pub fn signal(macd_series: &[Option<f64>], signal_period: usize) -> Series {
    exponential_moving_average_sparse(macd_series, signal_period)
}

// ============================================================================
// Cache
// ============================================================================

/// All indicator series for one parameter set, built once per pass
#[derive(Debug, Clone, Default)]
pub struct IndicatorCache {
    pub sma: Series,
    pub stoch_k: Series,
    pub macd: Series,
    pub signal: Series,
}

impl IndicatorCache {
    pub fn build(candles: &[Candle], params: &StrategyParams) -> Self {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let macd_series = macd(candles, params.macd_fast, params.macd_slow);
        let signal_series = signal(&macd_series, params.macd_signal);

        Self {
            sma: moving_average(&closes, params.sma_period),
            stoch_k: centered_stochastic_k(candles, params.stoch_period, params.smooth_k),
            macd: macd_series,
            signal: signal_series,
        }
    }

    pub fn len(&self) -> usize {
        self.sma.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sma.is_empty()
    }
}

/// Compute and bundle all four series for one parameter set
pub fn build_cache(candles: &[Candle], params: &StrategyParams) -> IndicatorCache {
    IndicatorCache::build(candles, params)
}

/// Current and previous value of a series, when both are defined
pub fn pair(series: &[Option<f64>], i: usize) -> Option<(f64, f64)> {
    if i == 0 {
        return None;
    }
    match (series.get(i)?, series.get(i - 1)?) {
        (Some(cur), Some(prev)) => Some((*cur, *prev)),
        _ => None,
    }
}
