//! Backtest strategies: buy-and-hold, moving-average cross, RSI and Bollinger bands

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Strategy;
use crate::context::BacktestContext;
use crate::error::{EngineError, EngineResult};
use crate::indicators;
use crate::types::{Candle, Signal};

// ============================================================================
// Parameter coercion
// ============================================================================

/// Parameter maps come from JSON forms and query strings, so numbers may
/// arrive as integers, floats or numeric text.
#[derive(Deserialize)]
#[serde(untagged)]
enum LooseNumber {
    Int(u64),
    Float(f64),
    Text(String),
}

/// Integer parameter; floats truncate toward zero, text must be an integer.
fn loose_usize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
    match LooseNumber::deserialize(deserializer)? {
        LooseNumber::Int(n) => usize::try_from(n).map_err(de::Error::custom),
        LooseNumber::Float(f) if f.is_finite() && f >= 0.0 => Ok(f.trunc() as usize),
        LooseNumber::Float(f) => Err(de::Error::custom(format!("expected a non-negative integer, got {f}"))),
        LooseNumber::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("expected an integer, got \"{s}\""))),
    }
}

fn loose_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match LooseNumber::deserialize(deserializer)? {
        LooseNumber::Int(n) => Ok(n as f64),
        LooseNumber::Float(f) => Ok(f),
        LooseNumber::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("expected a number, got \"{s}\""))),
    }
}

// ============================================================================
// Buy and hold
// ============================================================================

/// Buys on the first bar and sells on the last.
#[derive(Debug, Default)]
pub struct BuyAndHoldStrategy {
    bought: bool,
}

impl Strategy for BuyAndHoldStrategy {
    fn name(&self) -> String {
        "Buy and Hold".to_string()
    }

    fn initialize(&mut self, _ctx: &BacktestContext, _candles: &[Candle]) {
        self.bought = false;
    }

    fn generate_signal(&mut self, index: usize, candles: &[Candle], _ctx: &BacktestContext) -> Signal {
        if index == 0 && !self.bought {
            self.bought = true;
            return Signal::Buy;
        }
        if index + 1 == candles.len() && self.bought {
            return Signal::Sell;
        }
        Signal::Hold
    }
}

// ============================================================================
// Moving average cross
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MaCrossParams {
    #[serde(alias = "short_period", deserialize_with = "loose_usize")]
    pub short_period: usize,
    #[serde(alias = "long_period", deserialize_with = "loose_usize")]
    pub long_period: usize,
}

impl Default for MaCrossParams {
    fn default() -> Self {
        Self {
            short_period: 5,
            long_period: 20,
        }
    }
}

/// Golden cross buys, dead cross sells (SMA of closes).
#[derive(Debug)]
pub struct MaCrossStrategy {
    params: MaCrossParams,
    short_ma: Vec<Option<f64>>,
    long_ma: Vec<Option<f64>>,
}

impl MaCrossStrategy {
    pub fn new(params: MaCrossParams) -> EngineResult<Self> {
        if params.short_period == 0 || params.short_period >= params.long_period {
            return Err(EngineError::InvalidParams(format!(
                "shortPeriod ({}) must be positive and below longPeriod ({})",
                params.short_period, params.long_period
            )));
        }
        Ok(Self {
            params,
            short_ma: Vec::new(),
            long_ma: Vec::new(),
        })
    }
}

impl Strategy for MaCrossStrategy {
    fn name(&self) -> String {
        format!(
            "MA Cross ({}/{})",
            self.params.short_period, self.params.long_period
        )
    }

    fn initialize(&mut self, _ctx: &BacktestContext, candles: &[Candle]) {
        let closes = indicators::closes(candles);
        self.short_ma = indicators::align(
            &indicators::sma(&closes, self.params.short_period),
            closes.len(),
        );
        self.long_ma = indicators::align(
            &indicators::sma(&closes, self.params.long_period),
            closes.len(),
        );
        debug!(
            short = self.params.short_period,
            long = self.params.long_period,
            "MA cross initialized"
        );
    }

    fn generate_signal(&mut self, index: usize, _candles: &[Candle], ctx: &BacktestContext) -> Signal {
        if index < self.params.long_period || index == 0 {
            return Signal::Hold;
        }
        let at = |series: &[Option<f64>], i: usize| series.get(i).copied().flatten();
        let (Some(short), Some(long), Some(prev_short), Some(prev_long)) = (
            at(&self.short_ma, index),
            at(&self.long_ma, index),
            at(&self.short_ma, index - 1),
            at(&self.long_ma, index - 1),
        ) else {
            return Signal::Hold;
        };

        let golden_cross = prev_short <= prev_long && short > long;
        let dead_cross = prev_short >= prev_long && short < long;

        if golden_cross && ctx.is_flat() {
            debug!(index, short, long, "Golden cross");
            Signal::Buy
        } else if dead_cross && ctx.has_position() {
            debug!(index, short, long, "Dead cross");
            Signal::Sell
        } else {
            Signal::Hold
        }
    }
}

// ============================================================================
// RSI
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RsiParams {
    #[serde(deserialize_with = "loose_usize")]
    pub period: usize,
    #[serde(alias = "oversold_level", alias = "oversold", deserialize_with = "loose_f64")]
    pub oversold_level: f64,
    #[serde(alias = "overbought_level", alias = "overbought", deserialize_with = "loose_f64")]
    pub overbought_level: f64,
}

impl Default for RsiParams {
    fn default() -> Self {
        Self {
            period: 14,
            oversold_level: 30.0,
            overbought_level: 70.0,
        }
    }
}

/// Buys oversold, sells overbought.
#[derive(Debug)]
pub struct RsiStrategy {
    params: RsiParams,
    rsi: Vec<Option<f64>>,
}

impl RsiStrategy {
    pub fn new(params: RsiParams) -> EngineResult<Self> {
        if params.period == 0 {
            return Err(EngineError::InvalidParams("period must be positive".to_string()));
        }
        if params.oversold_level >= params.overbought_level {
            return Err(EngineError::InvalidParams(format!(
                "oversoldLevel ({}) must be below overboughtLevel ({})",
                params.oversold_level, params.overbought_level
            )));
        }
        Ok(Self {
            params,
            rsi: Vec::new(),
        })
    }
}

impl Strategy for RsiStrategy {
    fn name(&self) -> String {
        format!(
            "RSI ({}, {:.0}/{:.0})",
            self.params.period, self.params.oversold_level, self.params.overbought_level
        )
    }

    fn initialize(&mut self, _ctx: &BacktestContext, candles: &[Candle]) {
        let closes = indicators::closes(candles);
        self.rsi = indicators::align(&indicators::rsi(&closes, self.params.period), closes.len());
        debug!(period = self.params.period, "RSI initialized");
    }

    fn generate_signal(&mut self, index: usize, _candles: &[Candle], ctx: &BacktestContext) -> Signal {
        if index <= self.params.period {
            return Signal::Hold;
        }
        let Some(rsi) = self.rsi.get(index).copied().flatten() else {
            return Signal::Hold;
        };

        if rsi < self.params.oversold_level && ctx.is_flat() {
            debug!(index, rsi, "RSI oversold");
            Signal::Buy
        } else if rsi > self.params.overbought_level && ctx.has_position() {
            debug!(index, rsi, "RSI overbought");
            Signal::Sell
        } else {
            Signal::Hold
        }
    }
}

// ============================================================================
// Bollinger bands
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BollingerBandsParams {
    #[serde(deserialize_with = "loose_usize")]
    pub period: usize,
    #[serde(alias = "std_dev_multiplier", alias = "k", deserialize_with = "loose_f64")]
    pub std_dev_multiplier: f64,
}

impl Default for BollingerBandsParams {
    fn default() -> Self {
        Self {
            period: 20,
            std_dev_multiplier: 2.0,
        }
    }
}

/// Buys below the lower band, sells above the upper band.
#[derive(Debug)]
pub struct BollingerBandsStrategy {
    params: BollingerBandsParams,
    upper: Vec<Option<f64>>,
    lower: Vec<Option<f64>>,
}

impl BollingerBandsStrategy {
    pub fn new(params: BollingerBandsParams) -> EngineResult<Self> {
        if params.period == 0 || params.std_dev_multiplier <= 0.0 {
            return Err(EngineError::InvalidParams(format!(
                "period ({}) and stdDevMultiplier ({}) must be positive",
                params.period, params.std_dev_multiplier
            )));
        }
        Ok(Self {
            params,
            upper: Vec::new(),
            lower: Vec::new(),
        })
    }
}

impl Strategy for BollingerBandsStrategy {
    fn name(&self) -> String {
        format!(
            "Bollinger Bands ({}, {:.1})",
            self.params.period, self.params.std_dev_multiplier
        )
    }

    fn initialize(&mut self, _ctx: &BacktestContext, candles: &[Candle]) {
        let bands =
            indicators::bollinger_bands(candles, self.params.period, self.params.std_dev_multiplier);
        self.upper = indicators::align(&bands.upper, candles.len());
        self.lower = indicators::align(&bands.lower, candles.len());
        debug!(
            period = self.params.period,
            k = self.params.std_dev_multiplier,
            "Bollinger bands initialized"
        );
    }

    fn generate_signal(&mut self, index: usize, candles: &[Candle], ctx: &BacktestContext) -> Signal {
        if index + 1 < self.params.period {
            return Signal::Hold;
        }
        let (Some(upper), Some(lower), Some(candle)) = (
            self.upper.get(index).copied().flatten(),
            self.lower.get(index).copied().flatten(),
            candles.get(index),
        ) else {
            return Signal::Hold;
        };

        if candle.close < lower && ctx.is_flat() {
            debug!(index, close = candle.close, lower, "Close below lower band");
            Signal::Buy
        } else if candle.close > upper && ctx.has_position() {
            debug!(index, close = candle.close, upper, "Close above upper band");
            Signal::Sell
        } else {
            Signal::Hold
        }
    }
}
