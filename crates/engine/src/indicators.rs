//! Technical indicator library
//!
//! Pure functions over price series. Every function returns a compact series
//! that starts at the first fully-covered window; an input shorter than the
//! warm-up period yields an empty `Vec`, which callers treat as "not ready".
//! Use [`align`] to map a compact series back onto input indices.
//!
//! Plain rolling windows (SMA, Bollinger bands, Donchian) stream through the
//! `ta` indicators; the SMA-seeded recurrences (EMA, RSI, ATR, ADX, MACD) are
//! computed here because `ta` seeds them with the first value instead.

use ta::indicators::{BollingerBands as TaBollingerBands, Maximum, Minimum, SimpleMovingAverage};
use ta::Next;

use crate::types::Candle;

// ============================================================================
// Series helpers
// ============================================================================

pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

pub fn volumes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.volume).collect()
}

/// Pad a compact series on the left so that `out[i]` corresponds to input index `i`.
pub fn align(series: &[f64], input_len: usize) -> Vec<Option<f64>> {
    let pad = input_len.saturating_sub(series.len());
    std::iter::repeat(None)
        .take(pad)
        .chain(series.iter().map(|&v| Some(v)))
        .take(input_len)
        .collect()
}

/// Difference between the last value and the value `period` entries earlier
pub fn slope(series: &[f64], period: usize) -> Option<f64> {
    let last = series.len().checked_sub(1)?;
    let earlier = last.checked_sub(period)?;
    Some(series[last] - series[earlier])
}

fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    candles
        .windows(2)
        .map(|w| {
            let (prev, cur) = (&w[0], &w[1]);
            (cur.high - cur.low)
                .max((cur.high - prev.close).abs())
                .max((cur.low - prev.close).abs())
        })
        .collect()
}

/// Wilder smoothing seeded with the plain mean of the first `period` values
fn wilder(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let p = period as f64;
    let mut current = values[..period].iter().sum::<f64>() / p;
    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(current);
    for &v in &values[period..] {
        current = (current * (p - 1.0) + v) / p;
        out.push(current);
    }
    out
}

// ============================================================================
// Moving averages
// ============================================================================

/// Run a streaming `ta` indicator over `inputs`, dropping the `period - 1`
/// outputs produced before the first full window.
fn full_windows<I, T, O>(
    indicator: &mut I,
    inputs: impl IntoIterator<Item = T>,
    period: usize,
) -> Vec<O>
where
    I: Next<T, Output = O>,
{
    inputs
        .into_iter()
        .map(|input| indicator.next(input))
        .skip(period.saturating_sub(1))
        .collect()
}

/// Simple moving average
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let Ok(mut sma) = SimpleMovingAverage::new(period) else {
        return Vec::new();
    };
    full_windows(&mut sma, values.iter().copied(), period)
}

/// Exponential moving average seeded with the SMA of the first `period` values
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut current = values[..period].iter().sum::<f64>() / period as f64;
    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(current);
    for &v in &values[period..] {
        current = (v - current) * multiplier + current;
        out.push(current);
    }
    out
}

/// Simple moving average of volume
pub fn volume_ma(volumes: &[f64], period: usize) -> Vec<f64> {
    sma(volumes, period)
}

// ============================================================================
// Oscillators
// ============================================================================

/// Relative strength index with Wilder smoothing.
///
/// The first value sits at input index `period`. When the average loss is
/// zero, RS is taken as 100, so an all-gain series reads 99.0099 rather
/// than 100.
pub fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }
    let p = period as f64;
    let to_rsi = |gain: f64, loss: f64| {
        let rs = if loss == 0.0 { 100.0 } else { gain / loss };
        100.0 - 100.0 / (1.0 + rs)
    };

    let (mut avg_gain, mut avg_loss) = (0.0, 0.0);
    for w in closes[..=period].windows(2) {
        let change = w[1] - w[0];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss += change.abs();
        }
    }
    avg_gain /= p;
    avg_loss /= p;

    let mut out = Vec::with_capacity(closes.len() - period);
    out.push(to_rsi(avg_gain, avg_loss));
    for w in closes[period..].windows(2) {
        let change = w[1] - w[0];
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
        out.push(to_rsi(avg_gain, avg_loss));
    }
    out
}

/// MACD line, signal line and histogram
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Macd {
    /// Starts at input index `slow - 1`
    pub macd_line: Vec<f64>,
    /// Starts at `macd_line` index `signal - 1`
    pub signal_line: Vec<f64>,
    /// Same alignment as `signal_line`
    pub histogram: Vec<f64>,
}

pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Macd {
    if fast == 0 || slow < fast || closes.len() < slow {
        return Macd::default();
    }
    let ema_fast = ema(closes, fast);
    let ema_slow = ema(closes, slow);
    if ema_fast.is_empty() || ema_slow.is_empty() {
        return Macd::default();
    }

    let offset = slow - fast;
    let macd_line: Vec<f64> = ema_slow
        .iter()
        .enumerate()
        .map(|(i, s)| ema_fast[i + offset] - s)
        .collect();

    let signal_line = ema(&macd_line, signal);
    let signal_offset = signal.saturating_sub(1);
    let histogram = signal_line
        .iter()
        .enumerate()
        .map(|(i, s)| macd_line[i + signal_offset] - s)
        .collect();

    Macd {
        macd_line,
        signal_line,
        histogram,
    }
}

// ============================================================================
// Volatility / trend strength
// ============================================================================

/// Average true range. The first value covers candles `0..=period`.
pub fn atr(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 || candles.len() < period + 1 {
        return Vec::new();
    }
    wilder(&true_ranges(candles), period)
}

/// Average directional index
pub fn adx(candles: &[Candle], length: usize) -> Vec<f64> {
    if length == 0 || candles.len() < length * 2 + 1 {
        return Vec::new();
    }

    let tr = true_ranges(candles);
    let (plus_dm, minus_dm): (Vec<f64>, Vec<f64>) = candles
        .windows(2)
        .map(|w| {
            let up = w[1].high - w[0].high;
            let down = w[0].low - w[1].low;
            let plus = if up > down && up > 0.0 { up } else { 0.0 };
            let minus = if down > up && down > 0.0 { down } else { 0.0 };
            (plus, minus)
        })
        .unzip();

    let smoothed_tr = wilder(&tr, length);
    let smoothed_plus = wilder(&plus_dm, length);
    let smoothed_minus = wilder(&minus_dm, length);

    let dx: Vec<f64> = smoothed_tr
        .iter()
        .zip(smoothed_plus.iter().zip(&smoothed_minus))
        .map(|(&atr, (&plus, &minus))| {
            let (pdi, mdi) = if atr > 0.0 {
                (plus / atr * 100.0, minus / atr * 100.0)
            } else {
                (0.0, 0.0)
            };
            let sum = pdi + mdi;
            if sum > 0.0 {
                (pdi - mdi).abs() / sum * 100.0
            } else {
                0.0
            }
        })
        .collect();

    wilder(&dx, length)
}

/// Donchian channel bounds
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Donchian {
    pub high: Vec<f64>,
    pub low: Vec<f64>,
}

pub fn donchian(candles: &[Candle], length: usize) -> Donchian {
    if length == 0 || candles.len() < length {
        return Donchian::default();
    }
    let (Ok(mut max), Ok(mut min)) = (Maximum::new(length), Minimum::new(length)) else {
        return Donchian::default();
    };
    Donchian {
        high: full_windows(&mut max, candles.iter().map(|c| c.high), length),
        low: full_windows(&mut min, candles.iter().map(|c| c.low), length),
    }
}

/// Bollinger bands over closing prices, using the population standard deviation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BollingerBands {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

pub fn bollinger_bands(candles: &[Candle], period: usize, k: f64) -> BollingerBands {
    if period == 0 || candles.len() < period {
        return BollingerBands::default();
    }
    let Ok(mut bb) = TaBollingerBands::new(period, k) else {
        return BollingerBands::default();
    };
    let mut bands = BollingerBands::default();
    for out in full_windows(&mut bb, candles.iter().map(|c| c.close), period) {
        bands.upper.push(out.upper);
        bands.middle.push(out.average);
        bands.lower.push(out.lower);
    }
    bands
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::Timeframe;
    use chrono::NaiveDate;

    /// Candles with the given (open, high, low, close, volume), one minute apart
    pub(crate) fn make_candles(bars: &[(f64, f64, f64, f64, f64)]) -> Vec<Candle> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        bars.iter()
            .enumerate()
            .map(|(i, &(open, high, low, close, volume))| Candle {
                market: "KRW-BTC".to_string(),
                timeframe: Timeframe::M1,
                timestamp: start + chrono::Duration::minutes(i as i64),
                open,
                high,
                low,
                close,
                volume,
                acc_trade_value: close * volume,
            })
            .collect()
    }

    pub(crate) fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        let bars: Vec<_> = closes
            .iter()
            .map(|&c| (c, c + 1.0, c - 1.0, c, 100.0))
            .collect();
        make_candles(&bars)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_sma_windows() {
        assert_eq!(sma(&[1.0, 2.0, 3.0, 4.0], 2), vec![1.5, 2.5, 3.5]);
        assert!(sma(&[1.0], 2).is_empty());
        assert!(sma(&[1.0, 2.0], 0).is_empty());
    }

    #[test]
    fn test_sma_long_series_matches_window_mean() {
        let values: Vec<f64> = (0..500).map(|i| 1000.0 + (i as f64 * 0.7).sin() * 37.5).collect();
        let result = sma(&values, 20);
        assert_eq!(result.len(), 500 - 20 + 1);
        for (out, window) in result.iter().zip(values.windows(20)) {
            let mean = window.iter().sum::<f64>() / 20.0;
            assert!((out - mean).abs() < 1e-6);
        }
        assert_eq!(volume_ma(&values, 20), result);
    }

    #[test]
    fn test_ema_seeded_with_sma() {
        assert_eq!(ema(&[1.0, 2.0, 3.0, 4.0, 5.0], 3), vec![2.0, 3.0, 4.0]);
        assert!(ema(&[1.0, 2.0], 3).is_empty());
    }

    #[test]
    fn test_rsi_all_gains_caps_below_100() {
        let closes: Vec<f64> = (1..=30).map(|v| v as f64).collect();
        let values = rsi(&closes, 14);
        assert_eq!(values.len(), closes.len() - 14);
        let ceiling = 100.0 - 100.0 / 101.0;
        for v in &values {
            assert!(approx(*v, ceiling));
            assert!(*v < 100.0);
        }
        assert!(approx(ceiling, 99.00990099009901));
    }

    #[test]
    fn test_rsi_all_losses_is_zero() {
        let closes: Vec<f64> = (1..=20).rev().map(|v| v as f64).collect();
        let values = rsi(&closes, 14);
        assert!(values.iter().all(|v| approx(*v, 0.0)));
    }

    #[test]
    fn test_rsi_requires_period_plus_one() {
        assert!(rsi(&[1.0; 14], 14).is_empty());
        assert_eq!(rsi(&[1.0; 15], 14).len(), 1);
    }

    #[test]
    fn test_atr_and_adx_flat_series_are_zero() {
        let candles = make_candles(&[(10.0, 10.0, 10.0, 10.0, 1.0); 40]);
        let atr_values = atr(&candles, 14);
        assert_eq!(atr_values.len(), 40 - 14);
        assert!(atr_values.iter().all(|v| *v == 0.0));

        let adx_values = adx(&candles, 14);
        assert!(!adx_values.is_empty());
        assert!(adx_values.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_atr_constant_range() {
        let candles = make_candles(&[(10.0, 12.0, 8.0, 10.0, 1.0); 20]);
        let values = atr(&candles, 5);
        assert!(values.iter().all(|v| approx(*v, 4.0)));
        assert!(atr(&candles[..5], 5).is_empty());
    }

    #[test]
    fn test_adx_strong_uptrend_is_high() {
        let bars: Vec<_> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                (base, base + 1.5, base - 0.5, base + 1.0, 10.0)
            })
            .collect();
        let candles = make_candles(&bars);
        let values = adx(&candles, 14);
        assert!(!values.is_empty());
        assert!(*values.last().unwrap() > 50.0);
        assert!(adx(&candles[..28], 14).is_empty());
        assert!(!adx(&candles[..29], 14).is_empty());
    }

    #[test]
    fn test_donchian_channel() {
        let candles = candles_from_closes(&[5.0, 7.0, 6.0, 9.0, 4.0]);
        let channel = donchian(&candles, 3);
        assert_eq!(channel.high, vec![8.0, 10.0, 10.0]);
        assert_eq!(channel.low, vec![4.0, 5.0, 3.0]);
        assert_eq!(donchian(&candles, 6), Donchian::default());
    }

    #[test]
    fn test_macd_alignment() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0).collect();
        let result = macd(&closes, 12, 26, 9);
        assert_eq!(result.macd_line.len(), 60 - 26 + 1);
        assert_eq!(result.signal_line.len(), result.macd_line.len() - 8);
        assert_eq!(result.histogram.len(), result.signal_line.len());

        let fast = ema(&closes, 12);
        let slow = ema(&closes, 26);
        assert!(approx(result.macd_line[0], fast[14] - slow[0]));
        assert!(approx(
            result.histogram[0],
            result.macd_line[8] - result.signal_line[0]
        ));
        assert_eq!(macd(&closes[..20], 12, 26, 9), Macd::default());
    }

    #[test]
    fn test_bollinger_population_std_dev() {
        let candles = candles_from_closes(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        let bands = bollinger_bands(&candles, 8, 2.0);
        assert_eq!(bands.middle.len(), 1);
        assert!(approx(bands.middle[0], 5.0));
        assert!(approx(bands.upper[0], 9.0));
        assert!(approx(bands.lower[0], 1.0));
    }

    #[test]
    fn test_align_and_slope() {
        let aligned = align(&[2.0, 3.0], 4);
        assert_eq!(aligned, vec![None, None, Some(2.0), Some(3.0)]);
        assert_eq!(slope(&[1.0, 2.0, 4.0, 7.0], 3), Some(6.0));
        assert_eq!(slope(&[1.0, 2.0], 3), None);
    }
}
