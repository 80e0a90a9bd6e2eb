//! Simulated order fills

use tracing::{debug, warn};

use crate::context::BacktestContext;
use crate::types::{BacktestConfig, Candle, Trade, TradeSide};

/// Fills market orders at the candle close, charging commission and slippage
/// on the order notional.
#[derive(Debug, Clone, Copy)]
pub struct OrderExecutor {
    pub commission_rate: f64,
    pub slippage_rate: f64,
}

impl OrderExecutor {
    pub fn new(commission_rate: f64, slippage_rate: f64) -> Self {
        Self {
            commission_rate,
            slippage_rate,
        }
    }

    pub fn from_config(config: &BacktestConfig) -> Self {
        Self::new(config.commission_rate_f64(), config.slippage_rate_f64())
    }

    fn costs(&self, amount: f64) -> (f64, f64) {
        (amount * self.commission_rate, amount * self.slippage_rate)
    }

    /// Spend `amount` of cash on the position. Returns false (and leaves the
    /// context untouched) when cash cannot cover amount plus costs.
    pub fn buy(&self, candle: &Candle, ctx: &mut BacktestContext, amount: f64, reason: &str) -> bool {
        let price = candle.close;
        let (commission, slippage) = self.costs(amount);
        let total_cost = amount + commission + slippage;

        if ctx.cash < total_cost || price <= 0.0 {
            warn!(
                at = %candle.timestamp,
                need = total_cost,
                have = ctx.cash,
                "Insufficient cash, skipping buy"
            );
            return false;
        }

        let volume = amount / price;
        let balance_before = ctx.cash;
        ctx.cash -= total_cost;
        ctx.add_position(volume, price);

        ctx.trades.push(Trade {
            timestamp: candle.timestamp,
            side: TradeSide::Buy,
            price,
            volume,
            total_amount: amount,
            commission: commission + slippage,
            reason: reason.to_string(),
            balance_before,
            balance_after: ctx.cash,
            portfolio_value: ctx.portfolio_value(price),
            profit_pct: None,
        });

        debug!(at = %candle.timestamp, volume, price, cost = total_cost, "BUY filled");
        true
    }

    /// Sell `volume` units. Returns false (and leaves the context untouched)
    /// when the position is smaller than `volume`.
    pub fn sell(&self, candle: &Candle, ctx: &mut BacktestContext, volume: f64, reason: &str) -> bool {
        let price = candle.close;
        if ctx.position < volume {
            warn!(
                at = %candle.timestamp,
                need = volume,
                have = ctx.position,
                "Insufficient position, skipping sell"
            );
            return false;
        }

        let amount = volume * price;
        let (commission, slippage) = self.costs(amount);
        let proceeds = amount - commission - slippage;

        let avg_buy_price = ctx.avg_buy_price;
        let profit_pct = if avg_buy_price > 0.0 {
            Some((price - avg_buy_price) / avg_buy_price * 100.0)
        } else {
            None
        };

        let balance_before = ctx.cash;
        ctx.cash += proceeds;
        ctx.reduce_position(volume);

        ctx.trades.push(Trade {
            timestamp: candle.timestamp,
            side: TradeSide::Sell,
            price,
            volume,
            total_amount: amount,
            commission: commission + slippage,
            reason: reason.to_string(),
            balance_before,
            balance_after: ctx.cash,
            portfolio_value: ctx.portfolio_value(price),
            profit_pct,
        });

        debug!(at = %candle.timestamp, volume, price, proceeds, profit_pct = ?profit_pct, "SELL filled");
        true
    }
}
