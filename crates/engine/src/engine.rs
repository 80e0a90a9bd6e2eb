//! Bar-by-bar backtesting engine
//!
//! One run: load candles, build the strategy, walk the candles in order
//! executing BUY/SELL signals, mark equity after every bar, then derive the
//! performance metrics. Any error marks the run FAILED and keeps whatever
//! trades and equity points were recorded up to that point.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use tracing::{debug, error, info};

use crate::context::BacktestContext;
use crate::error::{EngineError, EngineResult};
use crate::executor::OrderExecutor;
use crate::performance;
use crate::strategy::{create_strategy, Strategy};
use crate::types::*;

/// Historical candles for a backtest
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Candles of `market`/`timeframe` with `start <= timestamp <= end`,
    /// ascending and without duplicates.
    async fn load_candles(
        &self,
        market: &str,
        timeframe: Timeframe,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> EngineResult<Vec<Candle>>;
}

/// Inclusive timestamp range covered by the configured dates
pub fn date_range(config: &BacktestConfig) -> (NaiveDateTime, NaiveDateTime) {
    let start = config.start_date.and_hms_opt(0, 0, 0).unwrap_or_default();
    let end = config.end_date.and_hms_opt(23, 59, 59).unwrap_or_default();
    (start, end)
}

pub struct BacktestEngine {
    source: Arc<dyn CandleSource>,
}

impl BacktestEngine {
    pub fn new(source: Arc<dyn CandleSource>) -> Self {
        Self { source }
    }

    /// Run a backtest for `config`. Never fails: errors end up in the
    /// result as status FAILED with a message.
    pub async fn run(&self, config: BacktestConfig) -> BacktestResult {
        let started = Instant::now();
        info!(
            name = %config.name,
            market = %config.market,
            timeframe = %config.timeframe,
            strategy = %config.strategy_name,
            "Starting backtest"
        );

        let (start, end) = date_range(&config);
        match self
            .source
            .load_candles(&config.market, config.timeframe, start, end)
            .await
        {
            Ok(candles) => {
                info!(candles = candles.len(), "Loaded historical candles");
                run_with_timer(config, &candles, started)
            }
            Err(e) => {
                let mut result = BacktestResult::new(config);
                result.status = BacktestStatus::Running;
                finish_failed(&mut result, BacktestContext::new(0.0), e, started);
                result
            }
        }
    }
}

/// Run a backtest on already-loaded candles
pub fn run_on_candles(config: BacktestConfig, candles: &[Candle]) -> BacktestResult {
    run_with_timer(config, candles, Instant::now())
}

fn run_with_timer(config: BacktestConfig, candles: &[Candle], started: Instant) -> BacktestResult {
    let mut ctx = BacktestContext::new(config.initial_capital_f64());
    let mut result = BacktestResult::new(config);
    result.status = BacktestStatus::Running;

    match simulate(&result.config, candles, &mut ctx) {
        Ok(strategy_name) => {
            result.metrics = Some(performance::calculate(&ctx, result.config.days()));
            result.strategy_display_name = Some(strategy_name);
            result.trades = ctx.trades;
            result.equity_curve = ctx.equity_curve;
            result.status = BacktestStatus::Completed;
            result.completed_at = Some(Local::now().naive_local());
            result.execution_time_ms = started.elapsed().as_millis() as u64;
            info!(
                name = %result.config.name,
                trades = result.trades.len(),
                elapsed_ms = result.execution_time_ms,
                "Backtest completed"
            );
        }
        Err(e) => finish_failed(&mut result, ctx, e, started),
    }
    result
}

fn finish_failed(
    result: &mut BacktestResult,
    ctx: BacktestContext,
    e: EngineError,
    started: Instant,
) {
    error!(name = %result.config.name, error = %e, "Backtest failed");
    result.status = BacktestStatus::Failed;
    result.error_message = Some(e.to_string());
    result.trades = ctx.trades;
    result.equity_curve = ctx.equity_curve;
    result.execution_time_ms = started.elapsed().as_millis() as u64;
}

/// Walk the candles. Returns the strategy's display name.
fn simulate(
    config: &BacktestConfig,
    candles: &[Candle],
    ctx: &mut BacktestContext,
) -> EngineResult<String> {
    if candles.is_empty() {
        return Err(EngineError::NoData {
            market: config.market.clone(),
            timeframe: config.timeframe.to_string(),
            start: config.start_date.to_string(),
            end: config.end_date.to_string(),
        });
    }

    let mut strategy: Box<dyn Strategy> =
        create_strategy(&config.strategy_name, &config.strategy_params)?;
    let name = strategy.name();
    info!(strategy = %name, "Using strategy");

    let executor = OrderExecutor::from_config(config);
    let buy_fraction = config.buy_fraction_f64();
    let reason = format!("Strategy: {}", name);

    strategy.initialize(ctx, candles);

    for (index, candle) in candles.iter().enumerate() {
        match strategy.generate_signal(index, candles, ctx) {
            Signal::Buy if ctx.is_flat() => {
                let amount = ctx.cash * buy_fraction;
                if amount > 0.0 {
                    executor.buy(candle, ctx, amount, &reason);
                }
            }
            Signal::Sell if ctx.has_position() => {
                let volume = ctx.position;
                executor.sell(candle, ctx, volume, &reason);
            }
            _ => {}
        }

        let point = ctx.record_equity(candle.timestamp, candle.close);
        debug!(
            index,
            value = point.portfolio_value,
            drawdown = point.drawdown,
            "Equity recorded"
        );
    }

    Ok(name)
}
