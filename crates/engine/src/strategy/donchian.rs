//! V1: Donchian channel breakout with volume confirmation and ATR-based exits

use super::{ScanStrategy, ScanStrategyCode};
use crate::indicators;
use crate::types::{Candle, SignalResult};

pub const ENTRY_LENGTH: usize = 20;
pub const EXIT_LENGTH: usize = 10;
pub const VOLUME_LENGTH: usize = 20;
pub const VOLUME_MULTIPLIER: f64 = 1.2;
pub const ATR_LENGTH: usize = 14;
pub const ATR_STOP_MULTIPLIER: f64 = 1.5;
pub const TAKE_PROFIT_RATIO: f64 = 2.0;

/// Second-to-last value, or the only one
fn previous(series: &[f64]) -> Option<f64> {
    match series.len() {
        0 => None,
        1 => Some(series[0]),
        n => Some(series[n - 2]),
    }
}

/// Buys a close above the previous entry-channel high on heavy volume;
/// sells a close below the previous exit-channel low.
#[derive(Debug, Default)]
pub struct DonchianBreakoutStrategy;

impl ScanStrategy for DonchianBreakoutStrategy {
    fn code(&self) -> ScanStrategyCode {
        ScanStrategyCode::V1
    }

    fn name(&self) -> &'static str {
        "Donchian Breakout"
    }

    fn description(&self) -> &'static str {
        "5m close breaks the prior 20-bar high on 1.2x average volume; exits below the 10-bar low"
    }

    fn warmup_bars(&self) -> usize {
        78
    }

    fn evaluate(&self, _symbol: &str, fast: &[Candle], _slow: &[Candle]) -> SignalResult {
        let entry = indicators::donchian(fast, ENTRY_LENGTH);
        let exit = indicators::donchian(fast, EXIT_LENGTH);
        let volume_ma = indicators::volume_ma(&indicators::volumes(fast), VOLUME_LENGTH);
        let atr = indicators::atr(fast, ATR_LENGTH);

        let (Some(current), Some(&volume_ma), Some(&atr)) =
            (fast.last(), volume_ma.last(), atr.last())
        else {
            return SignalResult::none();
        };
        // Channels as of the previous bar, so the current bar can break them
        let (Some(prev_don_high), Some(don_low)) = (previous(&entry.high), previous(&exit.low))
        else {
            return SignalResult::none();
        };

        let close = current.close;
        let mut signal = SignalResult::none();

        let breakout_up = close > prev_don_high;
        let volume_confirm = current.volume >= volume_ma * VOLUME_MULTIPLIER;
        if breakout_up && volume_confirm {
            let stop = close - ATR_STOP_MULTIPLIER * atr;
            let target = close + TAKE_PROFIT_RATIO * (close - stop);
            signal = SignalResult::buy()
                .with_reasons(&["DON_BREAK_UP", "VOL_CONFIRM"])
                .at(current.timestamp)
                .with_levels(close, Some(stop), Some(target))
                .with_indicator("close", close)
                .with_indicator("donHigh", prev_don_high)
                .with_indicator("donLow", don_low)
                .with_indicator("volume", current.volume)
                .with_indicator("volumeMA", volume_ma)
                .with_indicator("atr", atr);
        }

        if close < don_low {
            signal = SignalResult::sell()
                .with_reasons(&["DON_BREAK_DOWN"])
                .at(current.timestamp)
                .with_indicator("close", close)
                .with_indicator("donLow", don_low);
        }

        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::tests::make_candles;
    use crate::types::SignalType;

    fn base_bars(n: usize) -> Vec<(f64, f64, f64, f64, f64)> {
        (0..n)
            .map(|i| {
                let wiggle = if i % 2 == 0 { 0.5 } else { -0.5 };
                let c = 100.0 + wiggle;
                (c, c + 1.0, c - 1.0, c, 100.0)
            })
            .collect()
    }

    #[test]
    fn test_breakout_with_volume_buys() {
        let mut bars = base_bars(80);
        bars.push((100.0, 106.0, 99.5, 105.0, 200.0));
        let candles = make_candles(&bars);

        let signal = DonchianBreakoutStrategy.evaluate("KRW-BTC", &candles, &[]);
        assert_eq!(signal.signal_type, SignalType::Buy);
        assert_eq!(signal.reason_codes, vec!["DON_BREAK_UP", "VOL_CONFIRM"]);
        assert_eq!(signal.entry_price, Some(105.0));
        let stop = signal.stop_price.unwrap();
        let target = signal.target_price.unwrap();
        assert!(stop < 105.0);
        assert!((target - 105.0 - 2.0 * (105.0 - stop)).abs() < 1e-9);
        assert_eq!(signal.indicators["donHigh"], serde_json::json!(101.5));
        assert_eq!(signal.candle_time, Some(candles.last().unwrap().timestamp));
    }

    #[test]
    fn test_breakout_without_volume_is_none() {
        let mut bars = base_bars(80);
        bars.push((100.0, 106.0, 99.5, 105.0, 110.0));
        let candles = make_candles(&bars);
        let signal = DonchianBreakoutStrategy.evaluate("KRW-BTC", &candles, &[]);
        assert_eq!(signal.signal_type, SignalType::None);
    }

    #[test]
    fn test_close_below_exit_low_sells() {
        let mut bars = base_bars(80);
        bars.push((100.0, 100.0, 94.0, 95.0, 100.0));
        let candles = make_candles(&bars);
        let signal = DonchianBreakoutStrategy.evaluate("KRW-BTC", &candles, &[]);
        assert_eq!(signal.signal_type, SignalType::Sell);
        assert_eq!(signal.reason_codes, vec!["DON_BREAK_DOWN"]);
        assert_eq!(signal.indicators["donLow"], serde_json::json!(98.5));
        assert_eq!(signal.indicators.len(), 2);
    }

    #[test]
    fn test_short_history_is_none() {
        let candles = make_candles(&base_bars(10));
        assert!(DonchianBreakoutStrategy
            .evaluate("KRW-BTC", &candles, &[])
            .is_none());
    }
}
