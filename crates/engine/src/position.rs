//! Single open short position, reused across trades within one run

use chrono::{DateTime, Utc};

/// Everything fixed at the moment an entry is accepted
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryFill {
    pub entry_price: f64,
    pub entry_index: usize,
    pub entry_time: DateTime<Utc>,
    pub quantity: f64,
    pub margin_used: f64,
    pub take_profit_price: f64,
    pub liquidation_price: f64,
    pub entry_fee: f64,
    pub leverage: f64,
}

/// `Flat -> Open -> Flat` state of the one position a run may hold
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionState {
    pub is_open: bool,
    pub entry_price: f64,
    pub entry_index: usize,
    pub entry_time: Option<DateTime<Utc>>,
    pub quantity: f64,
    pub margin_used: f64,
    pub take_profit_price: f64,
    pub liquidation_price: f64,
    pub entry_fee: f64,
    pub leverage: f64,
    pub bars_held: usize,
}

impl PositionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flat -> Open. Overwrites every field at once.
    pub fn open(&mut self, fill: EntryFill) {
        *self = Self {
            is_open: true,
            entry_price: fill.entry_price,
            entry_index: fill.entry_index,
            entry_time: Some(fill.entry_time),
            quantity: fill.quantity,
            margin_used: fill.margin_used,
            take_profit_price: fill.take_profit_price,
            liquidation_price: fill.liquidation_price,
            entry_fee: fill.entry_fee,
            leverage: fill.leverage,
            bars_held: 0,
        };
    }

    /// Open -> Flat
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Short convention: positive when `mark_price` is below entry
    pub fn unrealized_pnl(&self, mark_price: f64) -> f64 {
        if !self.is_open {
            return 0.0;
        }
        (self.entry_price - mark_price) * self.quantity
    }

    /// Margin plus open profit, the position's contribution to equity
    pub fn equity_contribution(&self, mark_price: f64) -> f64 {
        if !self.is_open {
            return 0.0;
        }
        self.margin_used + self.unrealized_pnl(mark_price)
    }
}
