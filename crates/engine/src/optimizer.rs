//! Parameter search over backtest passes
//!
//! Grid search walks the Cartesian product of `StrategyParams::grid`; random
//! search samples SMA/stochastic periods and filter toggles from a seeded
//! stream. Trials run in parallel chunks but are reported and reduced in
//! enumeration order, so the chosen best never depends on thread timing.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, RwLock,
};
use tracing::{debug, info, warn};

use crate::engine::BacktestEngine;
use crate::error::OptimizeError;
use crate::sink::ProgressSink;
use crate::state::{BacktestState, BacktestSummary};
use crate::strategy::{Strategy, StrategyKind};
use crate::types::{Candle, StrategyParams};

// ============================================================================
// Types
// ============================================================================

/// Bounds and sample count for random search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomSearchConfig {
    pub sample_count: usize,
    pub sma_min: usize,
    pub sma_max: usize,
    pub stoch_min: usize,
    pub stoch_max: usize,
    /// Search seed; falls back to the base params' `random_seed`
    pub seed: Option<u64>,
}

impl Default for RandomSearchConfig {
    fn default() -> Self {
        Self {
            sample_count: 100,
            sma_min: 20,
            sma_max: 100,
            stoch_min: 5,
            stoch_max: 30,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SearchMode {
    Grid,
    Random(RandomSearchConfig),
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchMode::Grid => write!(f, "grid"),
            SearchMode::Random(_) => write!(f, "random"),
        }
    }
}

/// Request to start an optimization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeRequest {
    pub base: StrategyParams,
    pub mode: SearchMode,
    #[serde(default)]
    pub strategy: StrategyKind,
}

/// Winner of a search
#[derive(Debug, Clone)]
pub struct OptimizeOutcome {
    pub best_params: StrategyParams,
    pub best_result: BacktestState,
    /// Enumeration index of the best trial
    pub best_index: usize,
    pub trials_run: usize,
    pub trials_total: usize,
}

impl OptimizeOutcome {
    pub fn was_cancelled(&self) -> bool {
        self.trials_run < self.trials_total
    }
}

/// Optimization run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeStatus {
    Idle,
    Running,
    Complete,
    Cancelled,
    Error,
}

/// Best trial so far, as shown while a search is running
#[derive(Debug, Clone, Serialize)]
pub struct BestSnapshot {
    pub iteration: usize,
    pub params: StrategyParams,
    pub summary: BacktestSummary,
}

/// Shared progress tracker between the search thread and whoever displays it
pub struct OptimizeProgress {
    pub status: RwLock<OptimizeStatus>,
    pub total_combinations: AtomicU32,
    pub completed: AtomicU32,
    pub cancelled: AtomicBool,
    pub best: RwLock<Option<BestSnapshot>>,
    pub error_message: RwLock<Option<String>>,
    /// Bar length used for the Sharpe figure in `best`
    pub interval_minutes: AtomicU32,
}

impl OptimizeProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(OptimizeStatus::Idle),
            total_combinations: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            best: RwLock::new(None),
            error_message: RwLock::new(None),
            interval_minutes: AtomicU32::new(1),
        }
    }

    /// Reset for a new optimization run
    pub fn reset(&self) {
        *self.status.write().unwrap() = OptimizeStatus::Running;
        self.total_combinations.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
        *self.best.write().unwrap() = None;
        *self.error_message.write().unwrap() = None;
    }

    /// Get progress as percentage
    pub fn progress_pct(&self) -> f32 {
        let total = self.total_combinations.load(Ordering::Relaxed);
        let done = self.completed.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.status.read().unwrap(), OptimizeStatus::Running)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

impl Default for OptimizeProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for OptimizeProgress {
    fn on_iteration(
        &self,
        index: usize,
        total: usize,
        _params: &StrategyParams,
        _result: &BacktestState,
    ) {
        self.total_combinations.store(total as u32, Ordering::Relaxed);
        self.completed.store((index + 1) as u32, Ordering::Relaxed);
    }

    fn on_best_updated(&self, params: &StrategyParams, result: &BacktestState) {
        let interval = self.interval_minutes.load(Ordering::Relaxed);
        *self.best.write().unwrap() = Some(BestSnapshot {
            iteration: self.completed.load(Ordering::Relaxed) as usize,
            params: params.clone(),
            summary: result.summary(interval),
        });
    }

    fn on_status(&self, text: &str) {
        debug!(status = text, "Optimizer status");
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Trial generation
// ============================================================================

/// Every combination of the base params' grid ranges, in nested
/// SMA -> stochastic -> MACD -> signal -> momentum order
pub fn grid_trials(base: &StrategyParams) -> Vec<StrategyParams> {
    let grid = &base.grid;
    let mut trials = Vec::with_capacity(grid.size());
    for &sma_period in &grid.sma_periods {
        for &stoch_period in &grid.stoch_periods {
            for &use_macd in &grid.use_macd {
                for &use_signal in &grid.use_signal {
                    for &use_momentum_exit in &grid.use_momentum_exit {
                        trials.push(StrategyParams {
                            sma_period,
                            stoch_period,
                            use_macd,
                            use_signal,
                            use_momentum_exit,
                            ..base.clone()
                        });
                    }
                }
            }
        }
    }
    trials
}

/// `sample_count` parameter sets drawn from a seeded stream
pub fn random_trials(
    base: &StrategyParams,
    config: &RandomSearchConfig,
) -> Result<Vec<StrategyParams>, OptimizeError> {
    check_range("sma", config.sma_min, config.sma_max)?;
    check_range("stochastic", config.stoch_min, config.stoch_max)?;

    let mut rng = StdRng::seed_from_u64(config.seed.unwrap_or(base.random_seed));
    let trials = (0..config.sample_count)
        .map(|_| {
            let sma_period = rng.gen_range(config.sma_min..=config.sma_max);
            let stoch_period = rng.gen_range(config.stoch_min..=config.stoch_max);
            let use_macd = rng.gen_bool(0.5);
            let use_signal = rng.gen_bool(0.5);
            let use_momentum_exit = rng.gen_bool(0.5);
            StrategyParams {
                sma_period,
                stoch_period,
                use_macd,
                use_signal,
                use_momentum_exit,
                ..base.clone()
            }
        })
        .collect();
    Ok(trials)
}

fn check_range(name: &str, min: usize, max: usize) -> Result<(), OptimizeError> {
    if min == 0 || min > max {
        return Err(OptimizeError::InvalidRange(format!(
            "{name} period range {min}..={max}"
        )));
    }
    Ok(())
}

// ============================================================================
// Search
// ============================================================================

pub fn grid_search(
    candles: &[Candle],
    base: &StrategyParams,
    strategy: &dyn Strategy,
    sink: &dyn ProgressSink,
) -> Result<OptimizeOutcome, OptimizeError> {
    info!(combinations = base.grid.size(), bars = candles.len(), "Starting grid search");
    evaluate(candles, &grid_trials(base), strategy, sink)
}

pub fn random_search(
    candles: &[Candle],
    base: &StrategyParams,
    config: &RandomSearchConfig,
    strategy: &dyn Strategy,
    sink: &dyn ProgressSink,
) -> Result<OptimizeOutcome, OptimizeError> {
    let trials = random_trials(base, config)?;
    info!(samples = trials.len(), bars = candles.len(), "Starting random search");
    evaluate(candles, &trials, strategy, sink)
}

pub fn optimize(
    candles: &[Candle],
    base: &StrategyParams,
    mode: &SearchMode,
    strategy: &dyn Strategy,
    sink: &dyn ProgressSink,
) -> Result<OptimizeOutcome, OptimizeError> {
    match mode {
        SearchMode::Grid => grid_search(candles, base, strategy, sink),
        SearchMode::Random(config) => random_search(candles, base, config, strategy, sink),
    }
}

/// Run a request against a shared tracker, recording the final status on it
pub fn run_optimization(
    request: &OptimizeRequest,
    candles: &[Candle],
    progress: &Arc<OptimizeProgress>,
) -> Result<OptimizeOutcome, OptimizeError> {
    progress.reset();
    let strategy = request.strategy.build();

    let outcome = optimize(candles, &request.base, &request.mode, strategy.as_ref(), progress.as_ref());
    match &outcome {
        Ok(found) if found.was_cancelled() => {
            *progress.status.write().unwrap() = OptimizeStatus::Cancelled;
        }
        Ok(_) => {
            *progress.status.write().unwrap() = OptimizeStatus::Complete;
        }
        Err(e) => {
            *progress.status.write().unwrap() = if progress.is_cancelled() {
                OptimizeStatus::Cancelled
            } else {
                OptimizeStatus::Error
            };
            *progress.error_message.write().unwrap() = Some(e.to_string());
        }
    }
    outcome
}

/// Run every trial and keep the one with the highest final balance; ties go
/// to the earlier trial.
fn evaluate(
    candles: &[Candle],
    trials: &[StrategyParams],
    strategy: &dyn Strategy,
    sink: &dyn ProgressSink,
) -> Result<OptimizeOutcome, OptimizeError> {
    if candles.is_empty() || trials.is_empty() {
        return Err(OptimizeError::NoValidTrial);
    }

    let total = trials.len();
    let chunk_size = rayon::current_num_threads().max(1) * 4;
    let mut best: Option<(usize, &StrategyParams, BacktestState)> = None;
    let mut completed = 0usize;

    sink.on_status("running");
    for chunk in trials.chunks(chunk_size) {
        if sink.is_cancelled() {
            warn!(completed, total, "Optimization cancelled");
            break;
        }

        let results: Vec<BacktestState> = chunk
            .par_iter()
            .map(|params| BacktestEngine::run(candles, params, strategy))
            .collect();

        for (params, result) in chunk.iter().zip(results) {
            let index = completed;
            completed += 1;
            sink.on_iteration(index, total, params, &result);

            if !result.is_valid() {
                continue;
            }
            let improved = best
                .as_ref()
                .map_or(true, |(_, _, current)| result.balance > current.balance);
            if improved {
                info!(
                    iteration = index + 1,
                    balance = result.balance,
                    trades = result.trade_count(),
                    sma = params.sma_period,
                    stoch = params.stoch_period,
                    macd = params.use_macd,
                    signal = params.use_signal,
                    momentum = params.use_momentum_exit,
                    "New best parameters"
                );
                sink.on_best_updated(params, &result);
                best = Some((index, params, result));
            }
        }
    }

    let (best_index, best_params, best_result) = best.ok_or(OptimizeError::NoValidTrial)?;
    sink.on_status("complete");
    info!(
        trials = completed,
        best_balance = best_result.balance,
        "Optimization complete"
    );

    Ok(OptimizeOutcome {
        best_params: best_params.clone(),
        best_result,
        best_index,
        trials_run: completed,
        trials_total: total,
    })
}
