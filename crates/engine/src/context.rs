//! Per-run portfolio state of a backtest

use chrono::NaiveDateTime;

use crate::types::{EquityPoint, Trade};

/// Positions below this size are treated as closed
pub const POSITION_EPSILON: f64 = 1e-8;

/// Mutable state owned by a single backtest run
#[derive(Debug, Clone)]
pub struct BacktestContext {
    pub initial_capital: f64,
    pub cash: f64,
    pub position: f64,
    pub avg_buy_price: f64,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub peak_capital: f64,
    pub current_drawdown: f64,
    /// Most negative drawdown seen so far (percent, <= 0)
    pub max_drawdown: f64,
}

impl BacktestContext {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            initial_capital,
            cash: initial_capital,
            position: 0.0,
            avg_buy_price: 0.0,
            trades: Vec::new(),
            equity_curve: Vec::new(),
            peak_capital: initial_capital,
            current_drawdown: 0.0,
            max_drawdown: 0.0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.position == 0.0
    }

    pub fn has_position(&self) -> bool {
        self.position > 0.0
    }

    pub fn portfolio_value(&self, price: f64) -> f64 {
        self.cash + self.position * price
    }

    /// Add to the position, keeping a volume-weighted average buy price
    pub fn add_position(&mut self, volume: f64, price: f64) {
        if self.position > 0.0 {
            let cost = self.position * self.avg_buy_price + volume * price;
            self.position += volume;
            self.avg_buy_price = cost / self.position;
        } else {
            self.position = volume;
            self.avg_buy_price = price;
        }
    }

    /// Reduce the position; dust below [`POSITION_EPSILON`] closes it.
    pub fn reduce_position(&mut self, volume: f64) {
        self.position -= volume;
        if self.position < POSITION_EPSILON {
            self.position = 0.0;
            self.avg_buy_price = 0.0;
        }
    }

    fn update_drawdown(&mut self, value: f64) {
        if value > self.peak_capital {
            self.peak_capital = value;
        }
        if self.peak_capital > 0.0 {
            self.current_drawdown = (value - self.peak_capital) / self.peak_capital * 100.0;
            self.max_drawdown = self.max_drawdown.min(self.current_drawdown);
        }
    }

    /// Mark the portfolio to `price` and append a point to the equity curve
    pub fn record_equity(&mut self, timestamp: NaiveDateTime, price: f64) -> &EquityPoint {
        let value = self.portfolio_value(price);
        self.update_drawdown(value);

        let cumulative_return = if self.initial_capital > 0.0 {
            (value - self.initial_capital) / self.initial_capital * 100.0
        } else {
            0.0
        };
        self.equity_curve.push(EquityPoint {
            timestamp,
            portfolio_value: value,
            cash: self.cash,
            position_value: self.position * price,
            cumulative_return,
            drawdown: self.current_drawdown,
            max_drawdown: self.max_drawdown,
        });
        &self.equity_curve[self.equity_curve.len() - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, minute, 0)
            .unwrap()
    }

    #[test]
    fn test_weighted_average_buy_price() {
        let mut ctx = BacktestContext::new(1000.0);
        ctx.add_position(1.0, 100.0);
        ctx.add_position(3.0, 200.0);
        assert_eq!(ctx.position, 4.0);
        assert!((ctx.avg_buy_price - 175.0).abs() < 1e-9);
    }

    #[test]
    fn test_reduce_position_clears_dust() {
        let mut ctx = BacktestContext::new(1000.0);
        ctx.add_position(1.0, 100.0);
        ctx.reduce_position(1.0 - 1e-10);
        assert!(ctx.is_flat());
        assert_eq!(ctx.avg_buy_price, 0.0);
    }

    #[test]
    fn test_max_drawdown_only_gets_worse() {
        let mut ctx = BacktestContext::new(100.0);
        ctx.add_position(1.0, 100.0);
        ctx.cash = 0.0;
        let prices = [100.0, 120.0, 90.0, 110.0, 130.0, 60.0, 140.0];
        for (i, p) in prices.iter().enumerate() {
            ctx.record_equity(ts(i as u32), *p);
        }
        let curve = &ctx.equity_curve;
        for pair in curve.windows(2) {
            assert!(pair[1].max_drawdown <= pair[0].max_drawdown);
        }
        assert!((ctx.max_drawdown - (60.0 - 130.0) / 130.0 * 100.0).abs() < 1e-9);
        assert_eq!(ctx.peak_capital, 140.0);
        assert_eq!(curve.last().unwrap().drawdown, 0.0);
    }

    #[test]
    fn test_cumulative_return() {
        let mut ctx = BacktestContext::new(200.0);
        let point = ctx.record_equity(ts(0), 1.0).clone();
        assert_eq!(point.cumulative_return, 0.0);
        ctx.cash = 250.0;
        let point = ctx.record_equity(ts(1), 1.0);
        assert!((point.cumulative_return - 25.0).abs() < 1e-9);
    }
}
