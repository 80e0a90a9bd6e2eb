//! V3: oversold mean reversion confirmed by a MACD histogram turn

use chrono::NaiveDateTime;

use super::{ScanStrategy, ScanStrategyCode};
use crate::indicators;
use crate::types::{Candle, SignalResult};

pub const EMA_LENGTH: usize = 25;
/// Minimum distance below the EMA, in percent
pub const GAP_PCT_THRESHOLD: f64 = 20.0;
pub const RSI_LENGTH: usize = 14;
pub const RSI_OVERSOLD: f64 = 30.0;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const ATR_LENGTH: usize = 14;
pub const ATR_STOP_MULTIPLIER: f64 = 1.5;
pub const TAKE_PROFIT_RATIO: f64 = 3.0;

/// Latest indicator values the reversal rules look at
#[derive(Debug, Clone, Copy)]
struct Readings {
    close: f64,
    ema: f64,
    rsi: f64,
    histogram: f64,
    histogram_prev: f64,
    atr: f64,
}

impl Readings {
    fn from_candles(fast: &[Candle]) -> Option<Self> {
        let closes = indicators::closes(fast);
        let ema = *indicators::ema(&closes, EMA_LENGTH).last()?;
        let rsi = *indicators::rsi(&closes, RSI_LENGTH).last()?;
        let histogram = indicators::macd(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL).histogram;
        let atr = *indicators::atr(fast, ATR_LENGTH).last()?;
        let current = *histogram.last()?;
        let prev = match histogram.len() {
            1 => 0.0,
            n => histogram[n - 2],
        };
        Some(Self {
            close: fast.last()?.close,
            ema,
            rsi,
            histogram: current,
            histogram_prev: prev,
            atr,
        })
    }

    fn signal(&self, candle_time: NaiveDateTime) -> SignalResult {
        let gap_pct = (self.ema - self.close) / self.ema * 100.0;
        let gap_ok = gap_pct >= GAP_PCT_THRESHOLD;
        let rsi_oversold = self.rsi <= RSI_OVERSOLD;
        let hist_cross_up = self.histogram_prev <= 0.0 && self.histogram > 0.0;

        if gap_ok && rsi_oversold && hist_cross_up {
            let stop = self.close - ATR_STOP_MULTIPLIER * self.atr;
            let target = self.close + TAKE_PROFIT_RATIO * (self.close - stop);
            return SignalResult::buy()
                .with_reasons(&["GAP_OK", "RSI_OVERSOLD", "HIST_CROSS_UP"])
                .at(candle_time)
                .with_levels(self.close, Some(stop), Some(target))
                .with_indicator("close", self.close)
                .with_indicator("ema25", self.ema)
                .with_indicator("gapPct", gap_pct)
                .with_indicator("rsi14", self.rsi)
                .with_indicator("histogram", self.histogram)
                .with_indicator("histogramPrev", self.histogram_prev)
                .with_indicator("atr14", self.atr)
                .with_indicator("stop", stop)
                .with_indicator("target", target);
        }

        let hist_cross_down = self.histogram_prev >= 0.0 && self.histogram < 0.0;
        if hist_cross_down {
            return SignalResult::sell()
                .with_reasons(&["HIST_CROSS_DOWN_EXIT"])
                .at(candle_time)
                .with_indicator("histogram", self.histogram)
                .with_indicator("histogramPrev", self.histogram_prev);
        }

        SignalResult::none()
    }
}

#[derive(Debug, Default)]
pub struct ReversalStrategy;

impl ScanStrategy for ReversalStrategy {
    fn code(&self) -> ScanStrategyCode {
        ScanStrategyCode::V3
    }

    fn name(&self) -> &'static str {
        "Reversal"
    }

    fn description(&self) -> &'static str {
        "5m close 20% under EMA25 with RSI14 <= 30 and the MACD histogram turning positive"
    }

    fn warmup_bars(&self) -> usize {
        78
    }

    fn evaluate(&self, _symbol: &str, fast: &[Candle], _slow: &[Candle]) -> SignalResult {
        match (Readings::from_candles(fast), fast.last()) {
            (Some(readings), Some(current)) => readings.signal(current.timestamp),
            _ => SignalResult::none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::tests::{candles_from_closes, make_candles};
    use crate::types::SignalType;
    use chrono::NaiveDate;

    fn time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn readings() -> Readings {
        Readings {
            close: 75.0,
            ema: 100.0,
            rsi: 25.0,
            histogram: 0.4,
            histogram_prev: -0.1,
            atr: 2.0,
        }
    }

    #[test]
    fn test_all_conditions_buy_with_three_r_target() {
        let signal = readings().signal(time());
        assert_eq!(signal.signal_type, SignalType::Buy);
        assert_eq!(signal.reason_codes, vec!["GAP_OK", "RSI_OVERSOLD", "HIST_CROSS_UP"]);
        assert_eq!(signal.stop_price, Some(72.0));
        assert_eq!(signal.target_price, Some(84.0));
        assert_eq!(signal.indicators["gapPct"], serde_json::json!(25.0));
        assert_eq!(signal.indicators.len(), 9);
    }

    #[test]
    fn test_small_gap_does_not_buy() {
        let r = Readings {
            close: 90.0,
            ..readings()
        };
        assert!(r.signal(time()).is_none());
    }

    #[test]
    fn test_rsi_not_oversold_does_not_buy() {
        let r = Readings {
            rsi: 35.0,
            ..readings()
        };
        assert!(r.signal(time()).is_none());
    }

    #[test]
    fn test_histogram_cross_down_sells() {
        let r = Readings {
            histogram: -0.2,
            histogram_prev: 0.3,
            ..readings()
        };
        let signal = r.signal(time());
        assert_eq!(signal.signal_type, SignalType::Sell);
        assert_eq!(signal.reason_codes, vec!["HIST_CROSS_DOWN_EXIT"]);
    }

    #[test]
    fn test_flat_market_is_none() {
        let candles = candles_from_closes(&[100.0; 100]);
        assert!(ReversalStrategy.evaluate("KRW-BTC", &candles, &[]).is_none());
    }

    #[test]
    fn test_short_history_is_none() {
        let candles = make_candles(&[(1.0, 1.0, 1.0, 1.0, 1.0); 20]);
        assert!(ReversalStrategy.evaluate("KRW-BTC", &candles, &[]).is_none());
    }
}
