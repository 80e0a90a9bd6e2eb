//! Return and risk metrics for a finished backtest

use tracing::info;

use crate::context::BacktestContext;
use crate::types::{PerformanceMetrics, TradeSide};

/// Trading periods per year used to annualise the Sharpe ratio
pub const PERIODS_PER_YEAR: f64 = 252.0;

/// Derive metrics from a completed run. `days` is the length of the
/// configured date range.
pub fn calculate(ctx: &BacktestContext, days: i64) -> PerformanceMetrics {
    let initial = ctx.initial_capital;
    let final_capital = ctx
        .equity_curve
        .last()
        .map(|p| p.portfolio_value)
        .unwrap_or(initial);

    let total_return = if initial > 0.0 {
        (final_capital / initial - 1.0) * 100.0
    } else {
        0.0
    };

    let years = days as f64 / 365.0;
    let annual_return = if years > 0.0 && initial > 0.0 {
        ((final_capital / initial).powf(1.0 / years) - 1.0) * 100.0
    } else {
        total_return
    };

    let sharpe_ratio = sharpe_ratio(ctx);

    let mut metrics = PerformanceMetrics {
        total_return,
        annual_return,
        max_drawdown: ctx.max_drawdown,
        sharpe_ratio,
        final_capital,
        peak_capital: ctx.peak_capital,
        ..Default::default()
    };
    apply_trade_stats(ctx, &mut metrics);

    info!(
        total_return = %format!("{:.2}", total_return),
        max_drawdown = %format!("{:.2}", ctx.max_drawdown),
        sharpe = %format!("{:.2}", sharpe_ratio),
        "Performance metrics calculated"
    );
    metrics
}

fn sharpe_ratio(ctx: &BacktestContext) -> f64 {
    let curve = &ctx.equity_curve;
    if curve.len() < 2 {
        return 0.0;
    }

    let returns: Vec<f64> = curve
        .windows(2)
        .filter(|w| w[0].portfolio_value > 0.0)
        .map(|w| w[1].portfolio_value / w[0].portfolio_value - 1.0)
        .collect();
    if returns.is_empty() {
        return 0.0;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| r * r).sum::<f64>() / n - mean * mean;
    let std_dev = variance.max(0.0).sqrt();

    if std_dev > 0.0 {
        mean / std_dev * PERIODS_PER_YEAR.sqrt()
    } else {
        0.0
    }
}

fn apply_trade_stats(ctx: &BacktestContext, metrics: &mut PerformanceMetrics) {
    let (mut wins, mut losses) = (0u32, 0u32);
    let (mut total_profit, mut total_loss) = (0.0, 0.0);

    let closed = ctx
        .trades
        .iter()
        .filter(|t| t.side == TradeSide::Sell)
        .filter_map(|t| t.profit_pct);
    for profit in closed {
        if profit > 0.0 {
            wins += 1;
            total_profit += profit;
        } else if profit < 0.0 {
            losses += 1;
            total_loss += profit.abs();
        }
    }

    let total = wins + losses;
    metrics.total_trades = total;
    metrics.winning_trades = wins;
    metrics.losing_trades = losses;
    metrics.win_rate = if total > 0 {
        wins as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    metrics.avg_profit = if wins > 0 { total_profit / wins as f64 } else { 0.0 };
    metrics.avg_loss = if losses > 0 { total_loss / losses as f64 } else { 0.0 };
}
