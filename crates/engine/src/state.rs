//! Run-scoped accumulator: balance, equity curve, trade log

use serde::{Deserialize, Serialize};

use crate::types::TradeRecord;

/// Balance, drawdown and trade log of one backtest pass or live session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestState {
    pub starting_balance: f64,
    pub balance: f64,
    pub peak_equity: f64,
    pub max_drawdown: f64,
    /// Drawdown at `max_drawdown` as a percentage of the peak it fell from
    pub max_drawdown_pct: f64,
    pub wins: u32,
    pub losses: u32,
    /// One point per processed bar
    pub equity_curve: Vec<f64>,
    pub trades: Vec<TradeRecord>,
    pub total_fees: f64,
}

impl BacktestState {
    pub fn new(starting_balance: f64) -> Self {
        Self {
            starting_balance,
            balance: starting_balance,
            peak_equity: starting_balance,
            max_drawdown: 0.0,
            max_drawdown_pct: 0.0,
            wins: 0,
            losses: 0,
            equity_curve: Vec::new(),
            trades: Vec::new(),
            total_fees: 0.0,
        }
    }

    pub fn reset(&mut self, starting_balance: f64) {
        *self = Self::new(starting_balance);
    }

    /// Append a bar's equity and update peak / drawdown
    pub fn mark_equity(&mut self, value: f64) {
        self.equity_curve.push(value);
        self.track_drawdown(value);
    }

    /// Replace the most recent equity point (used when a position is settled
    /// after its bar was already marked)
    pub fn restate_last_equity(&mut self, value: f64) {
        match self.equity_curve.last_mut() {
            Some(last) => *last = value,
            None => self.equity_curve.push(value),
        }
        self.track_drawdown(value);
    }

    /// Book a closed trade. The bar's equity point is appended separately
    /// when the bar finishes.
    pub fn add_trade(&mut self, record: TradeRecord) {
        self.balance = record.balance_after;
        if record.net_pnl > 0.0 {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
        self.total_fees += record.fees();
        self.track_drawdown(self.balance);
        self.trades.push(record);
    }

    fn track_drawdown(&mut self, equity: f64) {
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        let drawdown = self.peak_equity - equity;
        if drawdown > self.max_drawdown {
            self.max_drawdown = drawdown;
            if self.peak_equity > 0.0 {
                self.max_drawdown_pct = drawdown / self.peak_equity * 100.0;
            }
        }
    }

    pub fn trade_count(&self) -> usize {
        self.trades.len()
    }

    /// A pass that processed at least one bar
    pub fn is_valid(&self) -> bool {
        !self.equity_curve.is_empty()
    }

    /// Derived statistics. `interval_minutes` is the bar length used to
    /// annualize the Sharpe ratio.
    pub fn summary(&self, interval_minutes: u32) -> BacktestSummary {
        let total_trades = self.trades.len() as u32;
        let win_rate = if total_trades > 0 {
            self.wins as f64 / total_trades as f64 * 100.0
        } else {
            0.0
        };

        let total_pnl = self.balance - self.starting_balance;
        let pct_of_start = |value: f64| {
            if self.starting_balance > 0.0 {
                value / self.starting_balance * 100.0
            } else {
                0.0
            }
        };

        let winners: Vec<f64> = self
            .trades
            .iter()
            .filter(|t| t.net_pnl > 0.0)
            .map(|t| pct_of_start(t.net_pnl))
            .collect();
        let losers: Vec<f64> = self
            .trades
            .iter()
            .filter(|t| t.net_pnl <= 0.0)
            .map(|t| pct_of_start(t.net_pnl))
            .collect();
        let avg_win_pct = mean(&winners).unwrap_or(0.0);
        let avg_loss_pct = mean(&losers).unwrap_or(0.0);
        let reward_risk = if losers.is_empty() || avg_loss_pct == 0.0 {
            None
        } else {
            Some(avg_win_pct / avg_loss_pct.abs())
        };

        BacktestSummary {
            total_trades,
            wins: self.wins,
            losses: self.losses,
            win_rate,
            total_pnl,
            total_pnl_pct: pct_of_start(total_pnl),
            final_balance: self.balance,
            avg_win_pct,
            avg_loss_pct,
            reward_risk,
            max_drawdown: self.max_drawdown,
            max_drawdown_pct: self.max_drawdown_pct,
            total_fees: self.total_fees,
            sharpe_ratio: sharpe_ratio(&self.equity_curve, interval_minutes),
        }
    }
}

impl Default for BacktestState {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Headline numbers of a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub final_balance: f64,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    /// `None` when there were no losing trades
    pub reward_risk: Option<f64>,
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub total_fees: f64,
    pub sharpe_ratio: f64,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Annualized Sharpe of per-bar equity returns
fn sharpe_ratio(equity_curve: &[f64], interval_minutes: u32) -> f64 {
    let returns: Vec<f64> = equity_curve
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }

    let n = returns.len() as f64;
    let avg = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - avg).powi(2)).sum::<f64>() / (n - 1.0);
    let std_dev = variance.sqrt();
    if std_dev < 1e-12 {
        return 0.0;
    }

    let bars_per_year = 365.0 * 24.0 * 60.0 / interval_minutes.max(1) as f64;
    avg / std_dev * bars_per_year.sqrt()
}
