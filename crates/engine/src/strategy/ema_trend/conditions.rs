//! Indicator readings and boolean conditions of the EMA trend strategy

use chrono::NaiveDateTime;

use super::config::EmaTrendConfig;
use crate::indicators;
use crate::types::Candle;

/// Latest indicator values for one evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Readings {
    pub ema20_15: f64,
    pub ema50_15: f64,
    pub ema20_5: f64,
    pub ema50_5: f64,
    pub spread15: f64,
    pub spread5: f64,
    pub slope_ema20: f64,
    pub slope_ema50: f64,
    pub close15: f64,
    pub current: Candle,
    pub previous: Candle,
    pub volume_ma5: f64,
    pub atr: f64,
}

impl Readings {
    /// `None` while any indicator is still warming up.
    pub fn compute(config: &EmaTrendConfig, fast: &[Candle], slow: &[Candle]) -> Option<Self> {
        let closes15 = indicators::closes(slow);
        let ema20_15_series = indicators::ema(&closes15, config.ema_short_period);
        let ema50_15_series = indicators::ema(&closes15, config.ema_long_period);

        let closes5 = indicators::closes(fast);
        let ema20_5 = *indicators::ema(&closes5, config.ema_short_period).last()?;
        let ema50_5 = *indicators::ema(&closes5, config.ema_long_period).last()?;
        let volume_ma5 =
            *indicators::volume_ma(&indicators::volumes(fast), config.volume_ma_period).last()?;
        let atr = *indicators::atr(fast, config.atr_period).last()?;

        let ema20_15 = *ema20_15_series.last()?;
        let ema50_15 = *ema50_15_series.last()?;
        let slope_ema20 = indicators::slope(&ema20_15_series, config.slope_period).unwrap_or(0.0);
        let slope_ema50 = indicators::slope(&ema50_15_series, config.slope_period).unwrap_or(0.0);

        let [.., previous, current] = fast else {
            return None;
        };

        Some(Self {
            ema20_15,
            ema50_15,
            ema20_5,
            ema50_5,
            spread15: ema20_15 - ema50_15,
            spread5: ema20_5 - ema50_5,
            slope_ema20,
            slope_ema50,
            close15: slow.last()?.close,
            current: current.clone(),
            previous: previous.clone(),
            volume_ma5,
            atr,
        })
    }

    pub fn candle_time(&self) -> NaiveDateTime {
        self.current.timestamp
    }
}

/// Boolean view of one evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Conditions {
    pub trend_up: bool,
    pub trend_down: bool,
    pub chop: bool,
    pub pullback_long: bool,
    pub pullback_short: bool,
    pub trigger_long: bool,
    pub trigger_short: bool,
    pub filter_long: bool,
    pub filter_short: bool,
}

impl Conditions {
    pub fn evaluate(r: &Readings, config: &EmaTrendConfig) -> Self {
        let c = &r.current;
        let trend_up = trend_up(r.ema20_15, r.ema50_15, r.slope_ema20, r.slope_ema50, r.close15);
        let trend_down =
            trend_down(r.ema20_15, r.ema50_15, r.slope_ema20, r.slope_ema50, r.close15);
        let tol = config.pullback_tolerance;
        let mult = config.volume_multiplier;

        Self {
            trend_up,
            trend_down,
            chop: ma_chop(r.spread5, r.spread15, config.spread_chop_min),
            pullback_long: trend_up
                && pullback_long(c.low, c.close, r.ema20_5, c.volume, r.volume_ma5, tol),
            pullback_short: trend_down
                && pullback_short(c.high, c.close, r.ema20_5, c.volume, r.volume_ma5, tol),
            trigger_long: trend_up
                && trigger_long(c.close, r.ema20_5, r.previous.high, c.volume, r.volume_ma5, mult),
            trigger_short: trend_down
                && trigger_short(c.close, r.ema20_5, r.previous.low, c.volume, r.volume_ma5, mult),
            filter_long: filter_long(c.close, r.ema20_5, r.ema50_5, config.spread_min),
            filter_short: filter_short(c.close, r.ema20_5, r.ema50_5, config.spread_min),
        }
    }

    pub fn has_trend(&self) -> bool {
        self.trend_up || self.trend_down
    }
}

// ============================================================================
// Individual rules
// ============================================================================

/// EMA20 > EMA50, both rising, close above EMA20
pub fn trend_up(ema20: f64, ema50: f64, slope20: f64, slope50: f64, close: f64) -> bool {
    ema20 > ema50 && slope20 > 0.0 && slope50 > 0.0 && close > ema20
}

pub fn trend_down(ema20: f64, ema50: f64, slope20: f64, slope50: f64, close: f64) -> bool {
    ema20 < ema50 && slope20 < 0.0 && slope50 < 0.0 && close < ema20
}

/// Low dips into the EMA band, close holds above it, on light volume
pub fn pullback_long(low: f64, close: f64, ema20: f64, volume: f64, volume_ma: f64, tol: f64) -> bool {
    low <= ema20 * (1.0 + tol) && close >= ema20 * (1.0 - tol) && volume < volume_ma
}

pub fn pullback_short(high: f64, close: f64, ema20: f64, volume: f64, volume_ma: f64, tol: f64) -> bool {
    high >= ema20 * (1.0 - tol) && close <= ema20 * (1.0 + tol) && volume < volume_ma
}

pub fn trigger_long(close: f64, ema20: f64, prev_high: f64, volume: f64, volume_ma: f64, mult: f64) -> bool {
    close > ema20 && close > prev_high && volume >= volume_ma * mult
}

pub fn trigger_short(close: f64, ema20: f64, prev_low: f64, volume: f64, volume_ma: f64, mult: f64) -> bool {
    close < ema20 && close < prev_low && volume >= volume_ma * mult
}

pub fn filter_long(close: f64, ema20: f64, ema50: f64, spread_min: f64) -> bool {
    ema20 - ema50 > spread_min && close > ema50
}

pub fn filter_short(close: f64, ema20: f64, ema50: f64, spread_min: f64) -> bool {
    ema20 - ema50 < -spread_min && close < ema50
}

pub fn ma_chop(spread5: f64, spread15: f64, chop_min: f64) -> bool {
    spread5.abs() < chop_min || spread15.abs() < chop_min
}

pub fn stop_long(close: f64, stop: f64, ema50: f64) -> bool {
    close < stop || close < ema50
}

pub fn stop_short(close: f64, stop: f64, ema50: f64) -> bool {
    close > stop || close > ema50
}

pub fn two_red(current: &Candle, previous: &Candle) -> bool {
    current.is_bearish() && previous.is_bearish()
}

pub fn two_green(current: &Candle, previous: &Candle) -> bool {
    current.is_bullish() && previous.is_bullish()
}
