//! Shortwave engine: short-only leveraged strategy research
//!
//! Provides:
//! - Indicator series (SMA, EMA, centered stochastic, MACD/signal)
//! - Exchange mechanics (fees, leverage tiers, liquidation, simulated fills)
//! - Bar-by-bar backtest engine with pluggable strategies
//! - Grid and random parameter search
//! - Live paper-trading loop with cursor-based reconciliation
//! - Bybit public API client for market data

pub mod api;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod live;
pub mod optimizer;
pub mod position;
pub mod sink;
pub mod state;
pub mod strategy;
pub mod trade_math;
pub mod types;

// Re-exports for convenience
pub use api::{interval_minutes, BybitClient};
pub use engine::{BacktestEngine, BarContext, BarProcessor};
pub use error::{FetchError, OptimizeError};
pub use indicators::{build_cache, IndicatorCache, Series};
pub use live::{
    CycleOutcome, LiveConfig, LiveProgress, LiveStatus, LiveTrader, MarketDataSource, Sleeper,
    TokioSleeper,
};
pub use optimizer::{
    grid_search, optimize, random_search, run_optimization, OptimizeOutcome, OptimizeProgress,
    OptimizeRequest, OptimizeStatus, RandomSearchConfig, SearchMode,
};
pub use position::PositionState;
pub use sink::{ChannelSink, EngineEvent, NullSink, ProgressSink};
pub use state::{BacktestState, BacktestSummary};
pub use strategy::{FixedHoldShort, Strategy, StrategyKind, TrendFilterShort};
pub use types::*;
