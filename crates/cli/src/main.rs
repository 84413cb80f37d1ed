//! Shortwave: short-only leveraged strategy research
//!
//! Usage:
//!   shortwave backtest --symbol ADAUSDT --days 30
//!   shortwave optimize --mode random --samples 200
//!   shortwave paper --optimize-first
//!   shortwave history

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use engine::{
    interval_minutes, run_optimization, BacktestEngine, BacktestSummary,
    BybitClient, Candle, ChannelSink, EngineEvent, LiveConfig, LiveProgress, LiveTrader,
    OptimizeOutcome, OptimizeProgress, OptimizeRequest, OptimizeStatus, RandomSearchConfig,
    SearchMode, StrategyKind, StrategyParams, TokioSleeper, TradeRecord,
};
use persistence::repository::{
    OptimizationRepository, OptimizationRunRecord, PaperTradeRecord, PaperTradeRepository,
};
use persistence::{params_hash, Database};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};

const PROGRESS_POLL_MS: u64 = 500;

#[derive(Parser)]
#[command(name = "shortwave")]
#[command(about = "Short-only leveraged strategy backtesting, optimization and paper trading", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Market and parameter selection shared by the subcommands
#[derive(clap::Args, Clone)]
struct MarketArgs {
    /// Bybit linear symbol
    #[arg(long, default_value = "ADAUSDT")]
    symbol: String,
    /// Bybit interval code (1, 5, 15, 60, 240, D, ...)
    #[arg(long, default_value = "1")]
    interval: String,
    /// Days of history to load
    #[arg(long, default_value_t = 30)]
    days: u32,
    /// Strategy variant: trend_filter or fixed_hold
    #[arg(long, default_value_t = StrategyKind::TrendFilter)]
    strategy: StrategyKind,
    /// JSON file with strategy parameters (missing fields use defaults)
    #[arg(long)]
    params: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Grid,
    Random,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one backtest over recent history
    Backtest {
        #[command(flatten)]
        market: MarketArgs,
    },
    /// Search parameters and persist the best
    Optimize {
        #[command(flatten)]
        market: MarketArgs,
        #[arg(long, value_enum, default_value = "grid")]
        mode: ModeArg,
        /// Random search: number of samples
        #[arg(long, default_value_t = 100)]
        samples: usize,
        /// Random search: seed (defaults to the params seed)
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Paper trade the latest best parameters on a live feed until Ctrl+C
    Paper {
        #[command(flatten)]
        market: MarketArgs,
        /// Run a grid search first instead of loading stored parameters
        #[arg(long)]
        optimize_first: bool,
        /// Bars fetched per poll
        #[arg(long, default_value_t = 200)]
        window: usize,
        /// Seconds between polls
        #[arg(long, default_value_t = 60)]
        poll_secs: u64,
    },
    /// List recent optimization runs
    History {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,shortwave=debug")
    } else {
        EnvFilter::new("info,engine=info,shortwave=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Backtest { market } => cmd_backtest(market).await?,
        Commands::Optimize {
            market,
            mode,
            samples,
            seed,
        } => {
            let mode = match mode {
                ModeArg::Grid => SearchMode::Grid,
                ModeArg::Random => SearchMode::Random(RandomSearchConfig {
                    sample_count: samples,
                    seed,
                    ..RandomSearchConfig::default()
                }),
            };
            cmd_optimize(market, mode).await?;
        }
        Commands::Paper {
            market,
            optimize_first,
            window,
            poll_secs,
        } => cmd_paper(market, optimize_first, window, poll_secs).await?,
        Commands::History { limit } => cmd_history(limit).await?,
    }

    Ok(())
}

// ============================================================================
// Setup helpers
// ============================================================================

async fn open_database() -> anyhow::Result<Database> {
    let db_path =
        std::env::var("SHORTWAVE_DB_PATH").unwrap_or_else(|_| "data/shortwave.db".to_string());
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let db = Database::new(&db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!("Database initialized: {}", db_path);
    Ok(db)
}

fn bybit_client() -> anyhow::Result<BybitClient> {
    let base_url = std::env::var("BYBIT_BASE_URL")
        .unwrap_or_else(|_| engine::api::bybit::DEFAULT_BASE_URL.to_string());
    Ok(BybitClient::new(base_url)?)
}

fn load_params(path: Option<&PathBuf>) -> anyhow::Result<StrategyParams> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading params file {}", path.display()))?;
            let params = serde_json::from_str(&raw)
                .with_context(|| format!("parsing params file {}", path.display()))?;
            Ok(params)
        }
        None => Ok(StrategyParams::default()),
    }
}

fn bar_minutes(interval: &str) -> anyhow::Result<u32> {
    interval_minutes(interval).ok_or_else(|| anyhow::anyhow!("unsupported interval '{}'", interval))
}

async fn fetch_history(client: &BybitClient, market: &MarketArgs) -> anyhow::Result<Vec<Candle>> {
    let end_ms = Utc::now().timestamp_millis();
    let start_ms = end_ms - i64::from(market.days) * 24 * 60 * 60 * 1000;
    let candles = client
        .fetch_history(&market.symbol, &market.interval, start_ms, end_ms)
        .await?;
    info!(symbol = %market.symbol, bars = candles.len(), "History loaded");
    Ok(candles)
}

// ============================================================================
// Backtest command
// ============================================================================

async fn cmd_backtest(market: MarketArgs) -> anyhow::Result<()> {
    let params = load_params(market.params.as_ref())?;
    let minutes = bar_minutes(&market.interval)?;
    let client = bybit_client()?;
    let candles = fetch_history(&client, &market).await?;

    let strategy = market.strategy.build();
    let state = BacktestEngine::run(&candles, &params, strategy.as_ref());
    if !state.is_valid() {
        anyhow::bail!("not enough data for a backtest ({} bars)", candles.len());
    }

    println!(
        "\n=== Backtest {} {} ({}, {} bars) ===",
        market.symbol,
        market.interval,
        market.strategy,
        candles.len()
    );
    print_summary(&state.summary(minutes));
    print_trades(&state.trades);
    Ok(())
}

// ============================================================================
// Optimize command
// ============================================================================

async fn cmd_optimize(market: MarketArgs, mode: SearchMode) -> anyhow::Result<()> {
    let base = load_params(market.params.as_ref())?;
    let minutes = bar_minutes(&market.interval)?;
    let db = open_database().await?;
    let client = bybit_client()?;
    let candles = fetch_history(&client, &market).await?;

    let request = OptimizeRequest {
        base,
        mode,
        strategy: market.strategy,
    };
    let (outcome, bars) = optimize_with_progress(request.clone(), candles, minutes).await?;

    println!("\n=== Best parameters (trial {}) ===", outcome.best_index + 1);
    println!(
        "  SMA {} | Stoch {} | MACD {} | Signal {} | Momentum exit {}",
        outcome.best_params.sma_period,
        outcome.best_params.stoch_period,
        outcome.best_params.use_macd,
        outcome.best_params.use_signal,
        outcome.best_params.use_momentum_exit
    );
    let summary = outcome.best_result.summary(minutes);
    print_summary(&summary);

    let record = run_record(&market, &request, &outcome, &summary, bars)?;
    OptimizationRepository::new(db.pool()).save(&record).await?;
    println!("\nSaved run {}", record.run_id);
    Ok(())
}

/// Run the optimizer on a blocking thread and draw a progress bar until it ends.
/// Ctrl+C cancels; the best of the completed trials is still returned.
async fn optimize_with_progress(
    request: OptimizeRequest,
    candles: Vec<Candle>,
    minutes: u32,
) -> anyhow::Result<(OptimizeOutcome, usize)> {
    let bars = candles.len();
    let progress = Arc::new(OptimizeProgress::new());
    progress.interval_minutes.store(minutes, Ordering::Relaxed);

    info!(mode = %request.mode, strategy = %request.strategy, bars, "Starting optimization");

    let progress_for_ctrlc = progress.clone();
    let ctrlc = tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        progress_for_ctrlc.cancel();
    });

    let progress_for_task = progress.clone();
    let handle = tokio::task::spawn_blocking(move || {
        run_optimization(&request, &candles, &progress_for_task)
    });

    loop {
        tokio::time::sleep(tokio::time::Duration::from_millis(PROGRESS_POLL_MS)).await;
        let status = *progress.status.read().unwrap();
        let completed = progress.completed.load(Ordering::Relaxed);
        let total = progress.total_combinations.load(Ordering::Relaxed);
        let pct = progress.progress_pct();
        let best_balance = progress
            .best
            .read()
            .unwrap()
            .as_ref()
            .map(|b| b.summary.final_balance)
            .unwrap_or_default();

        match status {
            OptimizeStatus::Running | OptimizeStatus::Idle => {
                let bar_len = 30;
                let filled = ((pct as usize) * bar_len / 100).min(bar_len);
                let bar: String = "=".repeat(filled) + &" ".repeat(bar_len - filled);
                print!(
                    "\r  [{}] {:.0}% ({}/{}) best balance {:.2}   ",
                    bar, pct, completed, total, best_balance
                );
                std::io::stdout().flush().ok();
            }
            OptimizeStatus::Complete | OptimizeStatus::Cancelled | OptimizeStatus::Error => {
                println!("\r  {:?}: {}/{} trials                                  ", status, completed, total);
                break;
            }
        }
    }

    ctrlc.abort();
    let outcome = handle.await??;
    if outcome.was_cancelled() {
        warn!(
            run = outcome.trials_run,
            total = outcome.trials_total,
            "Optimization cancelled, keeping best of completed trials"
        );
    }
    Ok((outcome, bars))
}

fn run_record(
    market: &MarketArgs,
    request: &OptimizeRequest,
    outcome: &OptimizeOutcome,
    summary: &BacktestSummary,
    bars: usize,
) -> anyhow::Result<OptimizationRunRecord> {
    let hash = params_hash(&outcome.best_params)?;
    Ok(OptimizationRunRecord {
        id: None,
        run_id: format!("{}-{}", Utc::now().timestamp_millis(), &hash[..12]),
        symbol: market.symbol.clone(),
        interval: market.interval.clone(),
        search_mode: request.mode.to_string(),
        strategy_kind: request.strategy.to_string(),
        params_hash: hash,
        params_json: serde_json::to_string(&outcome.best_params)?,
        summary_json: serde_json::to_string(summary)?,
        final_balance: outcome.best_result.balance,
        total_trades: outcome.best_result.trade_count() as i64,
        trials: outcome.trials_run as i64,
        bars: bars as i64,
        created_at: None,
    })
}

// ============================================================================
// Paper command
// ============================================================================

async fn cmd_paper(
    market: MarketArgs,
    optimize_first: bool,
    window: usize,
    poll_secs: u64,
) -> anyhow::Result<()> {
    let minutes = bar_minutes(&market.interval)?;
    let db = open_database().await?;
    let client = bybit_client()?;

    let params = if optimize_first {
        let candles = fetch_history(&client, &market).await?;
        let request = OptimizeRequest {
            base: load_params(market.params.as_ref())?,
            mode: SearchMode::Grid,
            strategy: market.strategy,
        };
        let (outcome, bars) = optimize_with_progress(request.clone(), candles, minutes).await?;
        let summary = outcome.best_result.summary(minutes);
        let record = run_record(&market, &request, &outcome, &summary, bars)?;
        OptimizationRepository::new(db.pool()).save(&record).await?;
        outcome.best_params
    } else {
        let latest = OptimizationRepository::new(db.pool())
            .latest_for(&market.symbol, &market.interval)
            .await?;
        match latest {
            Some(run) => {
                info!(run_id = %run.run_id, balance = run.final_balance, "Using stored parameters");
                serde_json::from_str(&run.params_json)?
            }
            None => {
                warn!(
                    symbol = %market.symbol,
                    interval = %market.interval,
                    "No stored optimization run, using configured parameters"
                );
                load_params(market.params.as_ref())?
            }
        }
    };

    let hash = params_hash(&params)?;
    let session_id = format!("paper-{}-{}", Utc::now().timestamp_millis(), &hash[..8]);
    let config = LiveConfig {
        symbol: market.symbol.clone(),
        interval: market.interval.clone(),
        window,
        poll_interval_ms: poll_secs * 1000,
        ..LiveConfig::default()
    };

    println!("\n=== Paper trading {} {} ===", config.symbol, config.interval);
    println!("Session: {}", session_id);
    println!("Press Ctrl+C to stop\n");

    let progress = Arc::new(LiveProgress::new());
    let progress_for_ctrlc = progress.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, stopping live loop...");
        progress_for_ctrlc.cancel();
    });

    let (sink, mut events) = ChannelSink::channel();
    let pool = db.pool_clone();
    let symbol = config.symbol.clone();
    let session_for_writer = session_id.clone();
    let writer = tokio::spawn(async move {
        let repo = PaperTradeRepository::new(&pool);
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::Trade(trade) => {
                    let record = paper_record(&session_for_writer, &symbol, &hash, &trade);
                    if let Err(e) = repo.save(&record).await {
                        error!(error = %e, "Failed to persist paper trade");
                    }
                }
                EngineEvent::Status(text) => info!(status = %text, "Live cycle"),
                _ => {}
            }
        }
    });

    let mut trader = LiveTrader::new(config, params, market.strategy.build());
    trader.run(&client, &TokioSleeper, &progress, &sink).await;
    drop(sink);
    writer.await?;

    println!("\n=== Paper session {} ===", session_id);
    print_summary(&trader.state().summary(minutes));
    let saved = PaperTradeRepository::new(db.pool())
        .list_for_session(&session_id)
        .await?;
    println!("  Persisted trades: {}", saved.len());
    Ok(())
}

fn paper_record(session_id: &str, symbol: &str, hash: &str, trade: &TradeRecord) -> PaperTradeRecord {
    PaperTradeRecord {
        id: None,
        session_id: session_id.to_string(),
        symbol: symbol.to_string(),
        params_hash: hash.to_string(),
        entry_time: trade.entry_time.timestamp_millis(),
        exit_time: trade.exit_time.timestamp_millis(),
        entry_price: trade.entry_price,
        exit_price: trade.exit_price,
        quantity: trade.quantity,
        margin_used: trade.margin_used,
        gross_pnl: trade.gross_pnl,
        net_pnl: trade.net_pnl,
        entry_fee: trade.entry_fee,
        exit_fee: trade.exit_fee,
        leverage: trade.leverage,
        liquidation_price: trade.liquidation_price,
        balance_after: trade.balance_after,
        reason: trade.reason.to_string(),
    }
}

// ============================================================================
// History command
// ============================================================================

async fn cmd_history(limit: i64) -> anyhow::Result<()> {
    let db = open_database().await?;
    let runs = OptimizationRepository::new(db.pool()).list_recent(limit).await?;
    if runs.is_empty() {
        println!("\nNo optimization runs stored.");
        return Ok(());
    }

    println!(
        "\n  {:<24} {:<10} {:>5} {:<7} {:<13} {:>12} {:>7} {:>7}",
        "Run", "Symbol", "Int", "Mode", "Strategy", "Balance", "Trades", "Trials"
    );
    println!("  {}", "-".repeat(94));
    for run in runs {
        println!(
            "  {:<24} {:<10} {:>5} {:<7} {:<13} {:>12.2} {:>7} {:>7}",
            run.run_id,
            run.symbol,
            run.interval,
            run.search_mode,
            run.strategy_kind,
            run.final_balance,
            run.total_trades,
            run.trials
        );
    }
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

fn print_summary(summary: &BacktestSummary) {
    println!(
        "  Trades: {} ({} wins / {} losses, {:.1}% win rate)",
        summary.total_trades, summary.wins, summary.losses, summary.win_rate
    );
    println!(
        "  Final balance: {:.2} | PnL: {:+.2} ({:+.2}%) | Fees: {:.2}",
        summary.final_balance, summary.total_pnl, summary.total_pnl_pct, summary.total_fees
    );
    println!(
        "  Avg win: {:.3}% | Avg loss: {:.3}% | Reward/risk: {}",
        summary.avg_win_pct,
        summary.avg_loss_pct,
        summary
            .reward_risk
            .map(|r| format!("{:.2}", r))
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!(
        "  Max drawdown: {:.2} ({:.2}%) | Sharpe: {:.2}",
        summary.max_drawdown, summary.max_drawdown_pct, summary.sharpe_ratio
    );
}

fn print_trades(trades: &[TradeRecord]) {
    println!(
        "\n  {:>3}  {:<17} {:<17} {:>10} {:>10} {:>6} {:>10}  {}",
        "#", "Entry", "Exit", "Entry px", "Exit px", "Lev", "Net PnL", "Reason"
    );
    println!("  {}", "-".repeat(96));
    for (i, t) in trades.iter().enumerate() {
        println!(
            "  {:>3}  {:<17} {:<17} {:>10.5} {:>10.5} {:>6.2} {:>+10.2}  {}",
            i + 1,
            t.entry_time.format("%Y-%m-%d %H:%M"),
            t.exit_time.format("%Y-%m-%d %H:%M"),
            t.entry_price,
            t.exit_price,
            t.leverage,
            t.net_pnl,
            t.reason
        );
    }
}

