//! Progress and result notifications
//!
//! The optimizer, backtest engine and live loop report through a
//! [`ProgressSink`] passed in by the caller. Calls are synchronous, so
//! implementations must return quickly.

use tokio::sync::mpsc;

use crate::state::BacktestState;
use crate::types::{StrategyParams, TradeRecord};

pub trait ProgressSink: Send + Sync {
    /// A trial finished (`index` is zero-based)
    fn on_iteration(
        &self,
        _index: usize,
        _total: usize,
        _params: &StrategyParams,
        _result: &BacktestState,
    ) {
    }

    /// A trial beat the best balance seen so far
    fn on_best_updated(&self, _params: &StrategyParams, _result: &BacktestState) {}

    fn on_trade(&self, _record: &TradeRecord) {}

    fn on_status(&self, _text: &str) {}

    /// Polled between units of work; `true` stops the caller early
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Discards every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {}

/// Notification forwarded over a channel
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Iteration {
        index: usize,
        total: usize,
        balance: f64,
        trades: usize,
    },
    BestUpdated {
        params: Box<StrategyParams>,
        balance: f64,
        trades: usize,
    },
    Trade(TradeRecord),
    Status(String),
}

/// Forwards notifications to an unbounded channel the caller drains
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn send(&self, event: EngineEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl ProgressSink for ChannelSink {
    fn on_iteration(
        &self,
        index: usize,
        total: usize,
        _params: &StrategyParams,
        result: &BacktestState,
    ) {
        self.send(EngineEvent::Iteration {
            index,
            total,
            balance: result.balance,
            trades: result.trade_count(),
        });
    }

    fn on_best_updated(&self, params: &StrategyParams, result: &BacktestState) {
        self.send(EngineEvent::BestUpdated {
            params: Box::new(params.clone()),
            balance: result.balance,
            trades: result.trade_count(),
        });
    }

    fn on_trade(&self, record: &TradeRecord) {
        self.send(EngineEvent::Trade(record.clone()));
    }

    fn on_status(&self, text: &str) {
        self.send(EngineEvent::Status(text.to_string()));
    }

    fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }
}
