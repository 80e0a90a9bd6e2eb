//! Tunables of the EMA trend strategy

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// | field               | default |
/// |---------------------|---------|
/// | pullback_tolerance  | 0.002   |
/// | volume_multiplier   | 1.3     |
/// | spread_min          | 0.001   |
/// | spread_chop_min     | 0.0005  |
/// | cooldown_bars       | 3       |
/// | slope_period        | 3       |
/// | ema_short_period    | 20      |
/// | ema_long_period     | 50      |
/// | volume_ma_period    | 20      |
/// | atr_period          | 14      |
/// | stop_atr_multiplier | 1.5     |
/// | take_profit_ratio   | 1.0     |
/// | min_bars_fast       | 100     |
/// | min_bars_slow       | 60      |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmaTrendConfig {
    /// Band around the fast EMA20 that counts as a pullback (fraction of price)
    pub pullback_tolerance: f64,
    /// Trigger volume must reach this multiple of the volume MA
    pub volume_multiplier: f64,
    /// Minimum EMA20 - EMA50 spread for the entry filter
    pub spread_min: f64,
    /// Below this absolute spread on either timeframe the market is choppy
    pub spread_chop_min: f64,
    pub cooldown_bars: u32,
    pub slope_period: usize,
    pub ema_short_period: usize,
    pub ema_long_period: usize,
    pub volume_ma_period: usize,
    pub atr_period: usize,
    pub stop_atr_multiplier: f64,
    pub take_profit_ratio: f64,
    pub min_bars_fast: usize,
    pub min_bars_slow: usize,
}

impl Default for EmaTrendConfig {
    fn default() -> Self {
        Self {
            pullback_tolerance: 0.002,
            volume_multiplier: 1.3,
            spread_min: 0.001,
            spread_chop_min: 0.0005,
            cooldown_bars: 3,
            slope_period: 3,
            ema_short_period: 20,
            ema_long_period: 50,
            volume_ma_period: 20,
            atr_period: 14,
            stop_atr_multiplier: 1.5,
            take_profit_ratio: 1.0,
            min_bars_fast: 100,
            min_bars_slow: 60,
        }
    }
}

impl EmaTrendConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.ema_short_period == 0 || self.ema_short_period >= self.ema_long_period {
            return Err(EngineError::InvalidParams(format!(
                "ema_short_period ({}) must be positive and below ema_long_period ({})",
                self.ema_short_period, self.ema_long_period
            )));
        }
        if self.volume_ma_period == 0 || self.atr_period == 0 || self.slope_period == 0 {
            return Err(EngineError::InvalidParams(
                "volume_ma_period, atr_period and slope_period must be positive".to_string(),
            ));
        }
        if self.stop_atr_multiplier <= 0.0 || self.pullback_tolerance < 0.0 {
            return Err(EngineError::InvalidParams(
                "stop_atr_multiplier must be positive and pullback_tolerance non-negative"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
