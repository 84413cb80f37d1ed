//! Live paper trading: replay the backtest's per-bar logic on a polled feed
//!
//! Each cycle re-fetches an overlapping window of recent candles, rebuilds the
//! indicator cache over it and feeds only the bars newer than the cursor to
//! the same [`BarProcessor`] a backtest uses. Position, balance and the fill
//! RNG carry over between cycles.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{info, warn};

use crate::engine::{BarContext, BarProcessor};
use crate::error::FetchError;
use crate::indicators::IndicatorCache;
use crate::position::PositionState;
use crate::sink::ProgressSink;
use crate::state::BacktestState;
use crate::strategy::Strategy;
use crate::types::{is_strictly_increasing, Candle, StrategyParams};

const WAIT_SLICE_MS: u64 = 500;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Source of recent candles, oldest-first and non-empty on success
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch(&self, symbol: &str, interval: &str, window: usize)
        -> Result<Vec<Candle>, FetchError>;
}

/// Injected clock for the loop's waits
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real waiting via the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub symbol: String,
    pub interval: String,
    /// Bars requested per fetch
    pub window: usize,
    pub poll_interval_ms: u64,
    pub retry_backoff_ms: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            symbol: "ADAUSDT".to_string(),
            interval: "1".to_string(),
            window: 200,
            poll_interval_ms: 60_000,
            retry_backoff_ms: 2_000,
        }
    }
}

impl LiveConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LiveStatus {
    Idle,
    Fetching,
    Reconciling,
    Waiting,
    Stopped,
}

/// Shared state of a running loop (same pattern as `OptimizeProgress`)
pub struct LiveProgress {
    pub status: RwLock<LiveStatus>,
    pub cancelled: AtomicBool,
    pub cycles: AtomicU32,
    pub fetch_failures: AtomicU32,
    pub last_error: RwLock<Option<String>>,
}

impl LiveProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(LiveStatus::Idle),
            cancelled: AtomicBool::new(false),
            cycles: AtomicU32::new(0),
            fetch_failures: AtomicU32::new(0),
            last_error: RwLock::new(None),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> LiveStatus {
        *self.status.read().unwrap()
    }

    fn set_status(&self, status: LiveStatus) {
        *self.status.write().unwrap() = status;
    }
}

impl Default for LiveProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// What one reconciliation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Number of new bars applied
    Processed(usize),
    NoNewBars,
    /// Window rejected because its timestamps were out of order
    Malformed,
}

// ---------------------------------------------------------------------------
// Trader
// ---------------------------------------------------------------------------

/// Long-lived paper-trading session
pub struct LiveTrader {
    config: LiveConfig,
    params: StrategyParams,
    strategy: Box<dyn Strategy>,
    processor: BarProcessor,
    cursor: Option<DateTime<Utc>>,
    /// Bars applied since the session started
    bars_applied: usize,
}

impl LiveTrader {
    pub fn new(config: LiveConfig, params: StrategyParams, strategy: Box<dyn Strategy>) -> Self {
        let processor = BarProcessor::new(&params);
        Self {
            config,
            params,
            strategy,
            processor,
            cursor: None,
            bars_applied: 0,
        }
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    /// Timestamp of the last bar already applied
    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        self.cursor
    }

    pub fn state(&self) -> &BacktestState {
        self.processor.state()
    }

    pub fn position(&self) -> &PositionState {
        self.processor.position()
    }

    /// Apply the bars of `candles` newer than the cursor, then advance it.
    ///
    /// Warm-up and indicator lookbacks use the window's own indexing; trade
    /// indices count bars applied since the session started.
    pub fn reconcile(&mut self, candles: &[Candle], sink: &dyn ProgressSink) -> CycleOutcome {
        let Some(last) = candles.last() else {
            return CycleOutcome::NoNewBars;
        };
        if !is_strictly_increasing(candles) {
            warn!(bars = candles.len(), "Fetched window out of order, skipping");
            return CycleOutcome::Malformed;
        }

        let start = match self.cursor {
            None => Some(0),
            Some(cursor) => candles.iter().position(|c| c.time > cursor),
        };
        let Some(start) = start else {
            return CycleOutcome::NoNewBars;
        };

        let cache = IndicatorCache::build(candles, &self.params);
        let ctx = BarContext {
            candles,
            cache: &cache,
            params: &self.params,
            strategy: self.strategy.as_ref(),
            warmup: self.params.warmup(),
            final_index: None,
            window_start: start,
            index_base: self.bars_applied,
        };

        for i in start..candles.len() {
            let was_open = self.processor.position().is_open;
            let trades_before = self.processor.state().trade_count();

            self.processor.process_bar(&ctx, i, sink);

            let state = self.processor.state();
            if state.trade_count() > trades_before {
                if let Some(trade) = state.trades.last() {
                    info!(
                        symbol = %self.config.symbol,
                        entry = trade.entry_price,
                        exit = trade.exit_price,
                        net_pnl = trade.net_pnl,
                        balance = trade.balance_after,
                        reason = %trade.reason,
                        "Closed paper short"
                    );
                }
            }
            let position = self.processor.position();
            if position.is_open && !was_open {
                info!(
                    symbol = %self.config.symbol,
                    time = %candles[i].time,
                    price = position.entry_price,
                    quantity = position.quantity,
                    leverage = position.leverage,
                    take_profit = position.take_profit_price,
                    liquidation = position.liquidation_price,
                    "Opened paper short"
                );
            }
        }

        self.cursor = Some(last.time);
        self.bars_applied += candles.len() - start;
        CycleOutcome::Processed(candles.len() - start)
    }

    /// Poll `source` until `progress` is cancelled.
    ///
    /// Fetch failures wait `retry_backoff` and retry indefinitely. A fetch
    /// that completes after cancellation is dropped without being applied.
    pub async fn run(
        &mut self,
        source: &dyn MarketDataSource,
        sleeper: &dyn Sleeper,
        progress: &LiveProgress,
        sink: &dyn ProgressSink,
    ) {
        info!(
            symbol = %self.config.symbol,
            interval = %self.config.interval,
            window = self.config.window,
            strategy = self.strategy.name(),
            "Live loop starting"
        );

        loop {
            if progress.is_cancelled() {
                break;
            }

            progress.set_status(LiveStatus::Fetching);
            let fetched = source
                .fetch(&self.config.symbol, &self.config.interval, self.config.window)
                .await;
            if progress.is_cancelled() {
                break;
            }

            let wait = match fetched {
                Err(e) => {
                    warn!(symbol = %self.config.symbol, error = %e, "Fetch failed, backing off");
                    progress.fetch_failures.fetch_add(1, Ordering::Relaxed);
                    *progress.last_error.write().unwrap() = Some(e.to_string());
                    sink.on_status(&format!("fetch failed: {e}"));
                    self.config.retry_backoff()
                }
                Ok(candles) => {
                    progress.set_status(LiveStatus::Reconciling);
                    let outcome = self.reconcile(&candles, sink);
                    progress.cycles.fetch_add(1, Ordering::Relaxed);
                    match outcome {
                        CycleOutcome::Processed(n) => sink.on_status(&format!(
                            "processed {n} new bars, balance {:.2}",
                            self.state().balance
                        )),
                        CycleOutcome::NoNewBars => sink.on_status("no new bars"),
                        CycleOutcome::Malformed => sink.on_status("window out of order"),
                    }
                    self.config.poll_interval()
                }
            };

            progress.set_status(LiveStatus::Waiting);
            if !wait_cancellable(sleeper, wait, progress).await {
                break;
            }
        }

        progress.set_status(LiveStatus::Stopped);
        info!(
            symbol = %self.config.symbol,
            trades = self.state().trade_count(),
            balance = self.state().balance,
            "Live loop stopped"
        );
    }
}

/// Sleep `total` in short slices. Returns `false` if cancelled meanwhile.
async fn wait_cancellable(sleeper: &dyn Sleeper, total: Duration, progress: &LiveProgress) -> bool {
    let slice = Duration::from_millis(WAIT_SLICE_MS);
    let mut remaining = total;
    while !remaining.is_zero() {
        if progress.is_cancelled() {
            return false;
        }
        let step = remaining.min(slice);
        sleeper.sleep(step).await;
        remaining -= step;
    }
    !progress.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BacktestEngine;
    use crate::sink::NullSink;
    use crate::strategy::{FixedHoldShort, TrendFilterShort};
    use crate::types::{ExitReason, TradeRecord};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    fn series(n: usize) -> Vec<Candle> {
        let t0 = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let x = i as f64;
                let close = 50.0 * 0.999f64.powi(i as i32) + (x * 0.9).sin() * 0.15;
                Candle {
                    time: t0 + ChronoDuration::minutes(i as i64),
                    open: close,
                    high: close + 0.1,
                    low: close - 0.1 - (x * 0.4).cos().abs() * 0.05,
                    close,
                    volume: 3.0,
                }
            })
            .collect()
    }

    fn params() -> StrategyParams {
        StrategyParams {
            sma_period: 8,
            stoch_period: 5,
            macd_fast: 3,
            macd_slow: 6,
            macd_signal: 3,
            max_bars_in_trade: 6,
            slippage_bps: 2.0,
            spread_bps: 1.0,
            ..Default::default()
        }
    }

    /// Backtest trades minus the forced close a live session never makes
    fn expected_live_trades(candles: &[Candle], strategy: &dyn Strategy) -> Vec<TradeRecord> {
        let mut trades = BacktestEngine::run(candles, &params(), strategy).trades;
        if trades.last().map(|t| t.reason) == Some(ExitReason::FinalClose) {
            trades.pop();
        }
        trades
    }

    fn trader(strategy: Box<dyn Strategy>) -> LiveTrader {
        let config = LiveConfig {
            poll_interval_ms: 1_000,
            retry_backoff_ms: 500,
            ..Default::default()
        };
        LiveTrader::new(config, params(), strategy)
    }

    #[test]
    fn test_split_reconcile_matches_backtest() {
        let candles = series(160);
        let expected = expected_live_trades(&candles, &FixedHoldShort);
        assert!(!expected.is_empty());

        for split in [1, 12, 40, 77, 120, 159] {
            let mut live = trader(Box::new(FixedHoldShort));
            assert_eq!(
                live.reconcile(&candles[..split], &NullSink),
                CycleOutcome::Processed(split)
            );
            assert_eq!(
                live.reconcile(&candles, &NullSink),
                CycleOutcome::Processed(candles.len() - split)
            );
            assert_eq!(live.state().trades, expected, "split at {split}");
            assert_eq!(live.state().equity_curve.len(), candles.len());
            assert_eq!(live.cursor(), candles.last().map(|c| c.time));
        }
    }

    #[test]
    fn test_many_small_windows_match_backtest() {
        let candles = series(150);
        let expected = expected_live_trades(&candles, &TrendFilterShort);

        let mut live = trader(Box::new(TrendFilterShort));
        for end in (5..=candles.len()).step_by(7).chain([candles.len()]) {
            live.reconcile(&candles[..end], &NullSink);
        }
        assert_eq!(live.state().trades, expected);
    }

    #[test]
    fn test_sliding_window_keeps_session_indices() {
        let candles = series(300);
        let mut live = trader(Box::new(FixedHoldShort));
        for end in (100..=candles.len()).step_by(10) {
            live.reconcile(&candles[end - 100..end], &NullSink);
        }

        let trades = &live.state().trades;
        assert!(trades.len() > 1);
        assert_eq!(live.bars_applied, candles.len());
        for trade in trades {
            assert!(trade.exit_index > trade.entry_index);
            assert_eq!(candles[trade.entry_index].time, trade.entry_time);
            assert_eq!(candles[trade.exit_index].time, trade.exit_time);
        }
        assert!(trades.windows(2).all(|w| w[1].entry_index > w[0].exit_index));
    }

    #[test]
    fn test_same_window_is_not_reprocessed() {
        let candles = series(90);
        let mut live = trader(Box::new(FixedHoldShort));
        live.reconcile(&candles, &NullSink);
        let snapshot = live.state().clone();
        let position = live.position().clone();

        assert_eq!(live.reconcile(&candles, &NullSink), CycleOutcome::NoNewBars);
        assert_eq!(live.reconcile(&candles[..60], &NullSink), CycleOutcome::NoNewBars);
        assert_eq!(*live.state(), snapshot);
        assert_eq!(*live.position(), position);
    }

    #[test]
    fn test_malformed_and_empty_windows() {
        let mut candles = series(30);
        let mut live = trader(Box::new(FixedHoldShort));
        assert_eq!(live.reconcile(&[], &NullSink), CycleOutcome::NoNewBars);

        candles.swap(3, 4);
        assert_eq!(live.reconcile(&candles, &NullSink), CycleOutcome::Malformed);
        assert_eq!(live.cursor(), None);
        assert!(live.state().equity_curve.is_empty());
    }

    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<Vec<Candle>, FetchError>>>,
        calls: AtomicU32,
        progress: Arc<LiveProgress>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<Vec<Candle>, FetchError>>, progress: Arc<LiveProgress>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU32::new(0),
                progress,
            }
        }
    }

    #[async_trait]
    impl MarketDataSource for ScriptedSource {
        async fn fetch(&self, symbol: &str, interval: &str, window: usize) -> Result<Vec<Candle>, FetchError> {
            assert_eq!((symbol, interval, window), ("ADAUSDT", "1", 200));
            self.calls.fetch_add(1, Ordering::Relaxed);
            let next = self.responses.lock().unwrap().pop_front();
            next.unwrap_or_else(|| {
                // script exhausted: stop the loop
                self.progress.cancel();
                Err(FetchError::Decode("script exhausted".into()))
            })
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    impl RecordingSleeper {
        fn total(&self) -> Duration {
            self.slept.lock().unwrap().iter().sum()
        }
    }

    #[tokio::test]
    async fn test_run_loop_recovers_from_fetch_failures() {
        let candles = series(140);
        let expected = expected_live_trades(&candles, &FixedHoldShort);
        let progress = Arc::new(LiveProgress::new());
        let source = ScriptedSource::new(
            vec![
                Err(FetchError::Status { status: 502, body: "bad gateway".into() }),
                Ok(candles[..80].to_vec()),
                Ok(candles[..80].to_vec()),
                Err(FetchError::Decode("truncated".into())),
                Ok(candles[30..].to_vec()),
                Ok(candles.clone()),
            ],
            progress.clone(),
        );
        let sleeper = RecordingSleeper::default();
        let mut live = trader(Box::new(FixedHoldShort));

        live.run(&source, &sleeper, &progress, &NullSink).await;

        assert_eq!(source.calls.load(Ordering::Relaxed), 7);
        assert_eq!(progress.cycles.load(Ordering::Relaxed), 4);
        assert_eq!(progress.fetch_failures.load(Ordering::Relaxed), 2);
        assert_eq!(progress.status(), LiveStatus::Stopped);
        assert!(progress.last_error.read().unwrap().is_some());
        // two backoffs of 500ms and four polls of 1s, in 500ms slices
        assert_eq!(sleeper.total(), Duration::from_millis(2 * 500 + 4 * 1_000));
        assert!(sleeper.slept.lock().unwrap().iter().all(|d| *d <= Duration::from_millis(500)));
        assert_eq!(live.cursor(), candles.last().map(|c| c.time));
        assert_eq!(live.state().equity_curve.len(), candles.len());
        // the first window started at bar 0, so its trades match the backtest
        let first_window: Vec<TradeRecord> =
            expected.into_iter().filter(|t| t.exit_index < 80).collect();
        assert_eq!(live.state().trades[..first_window.len()], first_window[..]);
    }

    #[tokio::test]
    async fn test_cancelled_loop_never_fetches() {
        let progress = Arc::new(LiveProgress::new());
        progress.cancel();
        let source = ScriptedSource::new(vec![Ok(series(20))], progress.clone());
        let sleeper = RecordingSleeper::default();
        let mut live = trader(Box::new(TrendFilterShort));

        live.run(&source, &sleeper, &progress, &NullSink).await;

        assert_eq!(source.calls.load(Ordering::Relaxed), 0);
        assert!(sleeper.slept.lock().unwrap().is_empty());
        assert_eq!(progress.status(), LiveStatus::Stopped);
        assert!(live.state().equity_curve.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_completing_after_cancel_is_dropped() {
        struct CancelOnFetch(Arc<LiveProgress>, Vec<Candle>);

        #[async_trait]
        impl MarketDataSource for CancelOnFetch {
            async fn fetch(&self, _: &str, _: &str, _: usize) -> Result<Vec<Candle>, FetchError> {
                self.0.cancel();
                Ok(self.1.clone())
            }
        }

        let progress = Arc::new(LiveProgress::new());
        let source = CancelOnFetch(progress.clone(), series(50));
        let mut live = trader(Box::new(FixedHoldShort));

        live.run(&source, &RecordingSleeper::default(), &progress, &NullSink).await;

        assert_eq!(live.cursor(), None);
        assert_eq!(progress.cycles.load(Ordering::Relaxed), 0);
    }
}
