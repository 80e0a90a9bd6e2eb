//! Types for the backtesting engine and the signal scanner

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// ============================================================================
// Market data
// ============================================================================

/// Candle interval, rendered with the short codes used across the API ("5m", "1d", ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Month1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
            Self::Month1 => "1M",
        }
    }

    /// Path segment of the Upbit candle endpoint for this interval
    pub fn upbit_path(&self) -> String {
        match self.minutes() {
            Some(m) if m < 24 * 60 => format!("minutes/{}", m),
            _ => match self {
                Self::D1 => "days".to_string(),
                Self::W1 => "weeks".to_string(),
                _ => "months".to_string(),
            },
        }
    }

    /// Length of one candle in minutes. Months have no fixed length.
    pub fn minutes(&self) -> Option<u32> {
        match self {
            Self::M1 => Some(1),
            Self::M3 => Some(3),
            Self::M5 => Some(5),
            Self::M15 => Some(15),
            Self::M30 => Some(30),
            Self::H1 => Some(60),
            Self::H4 => Some(240),
            Self::D1 => Some(24 * 60),
            Self::W1 => Some(7 * 24 * 60),
            Self::Month1 => None,
        }
    }

    /// Rough number of candles covering `days` calendar days
    pub fn estimate_count(&self, days: i64) -> u64 {
        let days = days.max(0) as u64;
        match self.minutes() {
            Some(m) => days * 24 * 60 / m as u64,
            None => days / 30,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Self::M1),
            "3m" => Ok(Self::M3),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "30m" => Ok(Self::M30),
            "1h" | "60m" => Ok(Self::H1),
            "4h" | "240m" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            "1w" => Ok(Self::W1),
            "1M" => Ok(Self::Month1),
            other => Err(EngineError::UnsupportedTimeframe(other.to_string())),
        }
    }
}

/// A single OHLCV candle for one market and timeframe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub market: String,
    pub timeframe: Timeframe,
    /// Candle open time (KST wall clock, as reported by Upbit)
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Accumulated traded value in quote currency
    pub acc_trade_value: f64,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

// ============================================================================
// Signals
// ============================================================================

/// Per-bar decision of a backtest strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

/// Outcome type of a live-scan evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalType {
    None,
    Buy,
    Sell,
}

/// Result of evaluating a live-scan strategy on one market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalResult {
    pub signal_type: SignalType,
    pub reason_codes: Vec<String>,
    pub indicators: BTreeMap<String, serde_json::Value>,
    pub candle_time: Option<NaiveDateTime>,
    pub entry_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
}

impl SignalResult {
    fn of(signal_type: SignalType) -> Self {
        Self {
            signal_type,
            reason_codes: Vec::new(),
            indicators: BTreeMap::new(),
            candle_time: None,
            entry_price: None,
            stop_price: None,
            target_price: None,
        }
    }

    pub fn none() -> Self {
        Self::of(SignalType::None)
    }

    pub fn buy() -> Self {
        Self::of(SignalType::Buy)
    }

    pub fn sell() -> Self {
        Self::of(SignalType::Sell)
    }

    pub fn is_none(&self) -> bool {
        self.signal_type == SignalType::None
    }

    pub fn with_reasons(mut self, codes: &[&str]) -> Self {
        self.reason_codes = codes.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn at(mut self, candle_time: NaiveDateTime) -> Self {
        self.candle_time = Some(candle_time);
        self
    }

    /// Attach entry, stop and target prices
    pub fn with_levels(mut self, entry: f64, stop: Option<f64>, target: Option<f64>) -> Self {
        self.entry_price = Some(entry);
        self.stop_price = stop;
        self.target_price = target;
        self
    }

    pub fn with_indicator(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.indicators.insert(name.to_string(), value.into());
        self
    }
}

// ============================================================================
// Backtest model
// ============================================================================

/// Configuration for a backtest run. Immutable once handed to the engine.
///
/// | field            | default        |
/// |------------------|----------------|
/// | initial_capital  | 1,000,000 KRW  |
/// | commission_rate  | 0.0005 (0.05%) |
/// | slippage_rate    | 0.0001 (0.01%) |
/// | buy_fraction     | 0.99           |
/// | strategy_name    | BUY_AND_HOLD   |
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub name: String,
    pub market: String,
    pub timeframe: Timeframe,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: Decimal,
    pub strategy_name: String,
    pub strategy_params: serde_json::Map<String, serde_json::Value>,
    pub commission_rate: Decimal,
    pub slippage_rate: Decimal,
    /// Share of available cash committed on each BUY
    pub buy_fraction: Decimal,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        let today = chrono::Local::now().date_naive();
        Self {
            name: "backtest".to_string(),
            market: "KRW-BTC".to_string(),
            timeframe: Timeframe::D1,
            start_date: today - chrono::Duration::days(365),
            end_date: today,
            initial_capital: dec!(1000000),
            strategy_name: "BUY_AND_HOLD".to_string(),
            strategy_params: serde_json::Map::new(),
            commission_rate: dec!(0.0005),
            slippage_rate: dec!(0.0001),
            buy_fraction: dec!(0.99),
        }
    }
}

impl BacktestConfig {
    pub fn initial_capital_f64(&self) -> f64 {
        self.initial_capital.to_f64().unwrap_or(0.0)
    }

    pub fn commission_rate_f64(&self) -> f64 {
        self.commission_rate.to_f64().unwrap_or(0.0)
    }

    pub fn slippage_rate_f64(&self) -> f64 {
        self.slippage_rate.to_f64().unwrap_or(0.0)
    }

    pub fn buy_fraction_f64(&self) -> f64 {
        self.buy_fraction.to_f64().unwrap_or(0.0)
    }

    /// Whole calendar days between start and end date
    pub fn days(&self) -> i64 {
        (self.end_date - self.start_date).num_days()
    }
}

/// Side of a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

/// A simulated fill recorded during a backtest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub timestamp: NaiveDateTime,
    pub side: TradeSide,
    pub price: f64,
    pub volume: f64,
    /// Order notional before costs
    pub total_amount: f64,
    /// Commission plus slippage
    pub commission: f64,
    pub reason: String,
    pub balance_before: f64,
    pub balance_after: f64,
    pub portfolio_value: f64,
    /// Percent gain vs. the average buy price (SELL only)
    pub profit_pct: Option<f64>,
}

/// A point on the equity curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: NaiveDateTime,
    pub portfolio_value: f64,
    pub cash: f64,
    pub position_value: f64,
    pub cumulative_return: f64,
    pub drawdown: f64,
    /// Running worst drawdown up to and including this point
    pub max_drawdown: f64,
}

/// Lifecycle of a backtest run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BacktestStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
}

impl BacktestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Return and risk metrics of a completed run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub annual_return: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub win_rate: f64,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub avg_profit: f64,
    pub avg_loss: f64,
    pub final_capital: f64,
    pub peak_capital: f64,
}

/// Result of a backtest run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub config: BacktestConfig,
    pub status: BacktestStatus,
    pub strategy_display_name: Option<String>,
    pub metrics: Option<PerformanceMetrics>,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
    pub completed_at: Option<NaiveDateTime>,
}

impl BacktestResult {
    pub fn new(config: BacktestConfig) -> Self {
        Self {
            config,
            status: BacktestStatus::NotStarted,
            strategy_display_name: None,
            metrics: None,
            trades: Vec::new(),
            equity_curve: Vec::new(),
            error_message: None,
            execution_time_ms: 0,
            completed_at: None,
        }
    }
}
