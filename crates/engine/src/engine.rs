//! Bar-by-bar short simulation
//!
//! [`BarProcessor`] owns the position, the run state and the fill RNG and
//! applies one bar at a time. [`BacktestEngine`] drives it over a full
//! history; the live loop drives the same processor over the unseen suffix
//! of each fetched window.

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, warn};

use crate::indicators::IndicatorCache;
use crate::position::{EntryFill, PositionState};
use crate::sink::{NullSink, ProgressSink};
use crate::state::BacktestState;
use crate::strategy::Strategy;
use crate::trade_math::{
    fee, resolve_leverage, short_liquidation_price, simulate_fill_price, take_profit_price,
};
use crate::types::{is_strictly_increasing, Candle, Direction, ExitReason, StrategyParams, TradeRecord};

/// Inputs shared by every bar of one pass
pub struct BarContext<'a> {
    pub candles: &'a [Candle],
    pub cache: &'a IndicatorCache,
    pub params: &'a StrategyParams,
    pub strategy: &'a dyn Strategy,
    /// Bars below this index never open a position
    pub warmup: usize,
    /// Bar on which an open position is force-closed, if any
    pub final_index: Option<usize>,
    /// First bar of `candles` not yet applied by an earlier pass
    pub window_start: usize,
    /// Run-wide index of the bar at `window_start`
    pub index_base: usize,
}

impl BarContext<'_> {
    /// Run-wide index recorded in trades for window bar `i`
    pub fn run_index(&self, i: usize) -> usize {
        self.index_base + i.saturating_sub(self.window_start)
    }
}

/// Per-bar decision and accounting, carrying state between calls
pub struct BarProcessor {
    state: BacktestState,
    position: PositionState,
    rng: StdRng,
}

impl BarProcessor {
    pub fn new(params: &StrategyParams) -> Self {
        Self {
            state: BacktestState::new(params.starting_balance),
            position: PositionState::new(),
            rng: StdRng::seed_from_u64(params.random_seed),
        }
    }

    pub fn state(&self) -> &BacktestState {
        &self.state
    }

    pub fn position(&self) -> &PositionState {
        &self.position
    }

    pub fn into_state(self) -> BacktestState {
        self.state
    }

    /// Apply entry, exit and equity marking for bar `i`
    pub fn process_bar(&mut self, ctx: &BarContext<'_>, i: usize, sink: &dyn ProgressSink) {
        let Some(candle) = ctx.candles.get(i) else {
            return;
        };

        if !self.position.is_open
            && i >= ctx.warmup
            && ctx
                .strategy
                .should_enter_short(ctx.candles, ctx.cache, i, ctx.params)
            && self.try_enter(ctx, i)
        {
            // Exit checks start on the next bar
            let equity = self.state.balance + self.position.margin_used;
            self.state.mark_equity(equity);
            return;
        }

        if self.position.is_open {
            self.position.bars_held += 1;

            let liquidated = self.position.liquidation_price > 0.0
                && candle.high >= self.position.liquidation_price;
            let reason = if liquidated {
                Some(ExitReason::Liquidation)
            } else {
                ctx.strategy
                    .should_exit_short(ctx.candles, ctx.cache, i, &self.position, ctx.params)
                    .or_else(|| (ctx.final_index == Some(i)).then_some(ExitReason::FinalClose))
            };

            if let Some(reason) = reason {
                self.close(ctx, i, reason, sink);
            }
        }

        let equity = self.state.balance + self.position.equity_contribution(candle.close);
        self.state.mark_equity(equity);
    }

    /// Close a position still open after the last bar (opened on that bar)
    /// at the final close, and restate the last equity point.
    pub fn settle(&mut self, ctx: &BarContext<'_>, sink: &dyn ProgressSink) {
        if !self.position.is_open || ctx.candles.is_empty() {
            return;
        }
        let last = ctx.candles.len() - 1;
        self.close(ctx, last, ExitReason::FinalClose, sink);
        let balance = self.state.balance;
        self.state.restate_last_equity(balance);
    }

    /// Reserve margin and open a short at bar `i`'s close. Returns `false`
    /// (leaving everything untouched) when the entry cannot be funded.
    fn try_enter(&mut self, ctx: &BarContext<'_>, i: usize) -> bool {
        let candle = &ctx.candles[i];
        let params = ctx.params;
        let balance = self.state.balance;

        let margin_used = balance * params.risk_fraction;
        let leverage = resolve_leverage(margin_used, params);
        let notional = margin_used * leverage;
        let fill_price = simulate_fill_price(Direction::Short, candle.close, params, &mut self.rng);
        let quantity = notional / fill_price;
        let entry_fee = fee(notional, params);

        if margin_used <= 0.0
            || !quantity.is_finite()
            || quantity <= 0.0
            || balance < margin_used + entry_fee
        {
            return false;
        }

        self.state.balance -= margin_used + entry_fee;
        self.position.open(EntryFill {
            entry_price: fill_price,
            entry_index: ctx.run_index(i),
            entry_time: candle.time,
            quantity,
            margin_used,
            take_profit_price: take_profit_price(fill_price, params),
            liquidation_price: short_liquidation_price(fill_price, leverage, params),
            entry_fee,
            leverage,
        });

        debug!(
            index = i,
            price = fill_price,
            quantity,
            leverage,
            margin = margin_used,
            "Opened SHORT position"
        );
        true
    }

    fn close(&mut self, ctx: &BarContext<'_>, i: usize, reason: ExitReason, sink: &dyn ProgressSink) {
        let candle = &ctx.candles[i];
        let position = &self.position;

        let exit_price = match reason {
            ExitReason::Liquidation => position.liquidation_price,
            ExitReason::TakeProfit => simulate_fill_price(
                Direction::Long,
                position.take_profit_price.min(candle.close),
                ctx.params,
                &mut self.rng,
            ),
            _ => candle.close,
        };

        let exit_fee = fee(exit_price * position.quantity, ctx.params);
        let gross_pnl = (position.entry_price - exit_price) * position.quantity;
        let net_pnl = gross_pnl - position.entry_fee - exit_fee;
        let balance_after = self.state.balance + position.margin_used + gross_pnl - exit_fee;

        let record = TradeRecord {
            entry_index: position.entry_index,
            exit_index: ctx.run_index(i),
            entry_time: position.entry_time.unwrap_or(candle.time),
            exit_time: candle.time,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.quantity,
            margin_used: position.margin_used,
            gross_pnl,
            net_pnl,
            entry_fee: position.entry_fee,
            exit_fee,
            leverage: position.leverage,
            liquidation_price: (position.liquidation_price > 0.0)
                .then_some(position.liquidation_price),
            balance_after,
            reason,
        };

        debug!(
            index = i,
            entry = record.entry_price,
            exit = exit_price,
            net_pnl,
            reason = %reason,
            "Closed position"
        );

        sink.on_trade(&record);
        self.state.add_trade(record);
        self.position.reset();
    }
}

/// Full-history backtest driver
pub struct BacktestEngine;

impl BacktestEngine {
    /// Run one pass over `candles`. Empty or out-of-order input yields an
    /// empty result rather than an error.
    pub fn run(candles: &[Candle], params: &StrategyParams, strategy: &dyn Strategy) -> BacktestState {
        Self::run_with_sink(candles, params, strategy, &NullSink)
    }

    pub fn run_with_sink(
        candles: &[Candle],
        params: &StrategyParams,
        strategy: &dyn Strategy,
        sink: &dyn ProgressSink,
    ) -> BacktestState {
        if candles.is_empty() {
            return BacktestState::new(params.starting_balance);
        }
        if !is_strictly_increasing(candles) {
            warn!(bars = candles.len(), "Candle timestamps not strictly increasing, skipping backtest");
            return BacktestState::new(params.starting_balance);
        }

        let cache = IndicatorCache::build(candles, params);
        let ctx = BarContext {
            candles,
            cache: &cache,
            params,
            strategy,
            warmup: params.warmup(),
            final_index: Some(candles.len() - 1),
            window_start: 0,
            index_base: 0,
        };

        debug!(
            strategy = strategy.name(),
            bars = candles.len(),
            warmup = ctx.warmup,
            sma = params.sma_period,
            stoch = params.stoch_period,
            "Starting backtest"
        );

        let mut processor = BarProcessor::new(params);
        for i in 0..candles.len() {
            processor.process_bar(&ctx, i, sink);
        }
        processor.settle(&ctx, sink);

        let state = processor.into_state();
        debug!(
            trades = state.trade_count(),
            balance = state.balance,
            max_drawdown = state.max_drawdown,
            "Backtest complete"
        );
        state
    }
}
