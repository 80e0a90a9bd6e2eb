//! V2: trend pullback to the fast EMA, gated by slow-timeframe ADX

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::debug;

use super::{ScanStrategy, ScanStrategyCode};
use crate::indicators;
use crate::session::SessionStore;
use crate::types::{Candle, SignalResult};

pub const EMA_LENGTH: usize = 20;
pub const ADX_LENGTH: usize = 14;
pub const ADX_THRESHOLD: f64 = 25.0;
/// Max distance from the EMA, in percent, that counts as a pullback
pub const PULLBACK_TOLERANCE_PCT: f64 = 0.2;
pub const EXPIRE_BARS: usize = 10;
pub const MIN_SLOW_BARS: usize = 50;

/// Armed pullback of one symbol
#[derive(Debug, Clone, Default, Serialize)]
pub struct PullbackSession {
    pub active: bool,
    pub pullback_high: f64,
    /// Open time of the bar that armed the pullback
    pub armed_at: Option<NaiveDateTime>,
}

impl PullbackSession {
    /// Bars in `fast` opened after the arming bar
    fn bars_since_armed(&self, fast: &[Candle]) -> usize {
        match self.armed_at {
            Some(armed_at) => fast
                .iter()
                .rev()
                .take_while(|c| c.timestamp > armed_at)
                .count(),
            None => 0,
        }
    }
}

pub struct PullbackStrategy {
    sessions: SessionStore<PullbackSession>,
}

impl PullbackStrategy {
    pub fn new(sessions: SessionStore<PullbackSession>) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &SessionStore<PullbackSession> {
        &self.sessions
    }
}

impl ScanStrategy for PullbackStrategy {
    fn code(&self) -> ScanStrategyCode {
        ScanStrategyCode::V2
    }

    fn name(&self) -> &'static str {
        "Holy Grail Pullback"
    }

    fn description(&self) -> &'static str {
        "15m ADX >= 25; 5m close pulls back within 0.2% of EMA20, then breaks the pullback high"
    }

    fn warmup_bars(&self) -> usize {
        56
    }

    fn evaluate(&self, symbol: &str, fast: &[Candle], slow: &[Candle]) -> SignalResult {
        if slow.len() < MIN_SLOW_BARS {
            return SignalResult::none();
        }
        let Some(&adx15) = indicators::adx(slow, ADX_LENGTH).last() else {
            return SignalResult::none();
        };
        if adx15 < ADX_THRESHOLD {
            return SignalResult::none();
        }
        let Some(&ema) = indicators::ema(&indicators::closes(fast), EMA_LENGTH).last() else {
            return SignalResult::none();
        };
        let Some(current) = fast.last() else {
            return SignalResult::none();
        };

        let close = current.close;
        let distance_pct = (close - ema).abs() / ema * 100.0;

        self.sessions.update(symbol, |session| {
            if distance_pct <= PULLBACK_TOLERANCE_PCT && !session.active {
                session.active = true;
                session.pullback_high = current.high;
                session.armed_at = Some(current.timestamp);
                debug!(symbol, distance_pct, "Pullback armed");
            }

            if session.active && close > session.pullback_high {
                let signal = SignalResult::buy()
                    .with_reasons(&["ADX_STRONG", "PULLBACK_NEAR_EMA", "BREAK_PULLBACK_HIGH"])
                    .at(current.timestamp)
                    .with_levels(close, None, None)
                    .with_indicator("adx15", adx15)
                    .with_indicator("ema5", ema)
                    .with_indicator("close5", close)
                    .with_indicator("distancePct", distance_pct)
                    .with_indicator("pullbackHigh", session.pullback_high)
                    .with_indicator("pullbackActive", session.active);
                session.active = false;
                return signal;
            }

            if session.active && session.bars_since_armed(fast) > EXPIRE_BARS {
                session.active = false;
                debug!(symbol, "Pullback expired");
            }

            if close < ema {
                return SignalResult::sell()
                    .with_reasons(&["CLOSE_BELOW_EMA"])
                    .at(current.timestamp)
                    .with_indicator("close5", close)
                    .with_indicator("ema5", ema);
            }

            SignalResult::none()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::tests::make_candles;
    use crate::types::SignalType;

    /// Steady 15m uptrend, strong ADX
    fn trending_slow() -> Vec<Candle> {
        let bars: Vec<_> = (0..60)
            .map(|i| {
                let b = 100.0 + i as f64;
                (b, b + 1.0, b - 0.2, b + 0.8, 10.0)
            })
            .collect();
        make_candles(&bars)
    }

    fn flat_fast(n: usize) -> Vec<(f64, f64, f64, f64, f64)> {
        vec![(100.0, 100.1, 99.9, 100.0, 10.0); n]
    }

    #[test]
    fn test_arm_then_break_high_buys_once() {
        let strategy = PullbackStrategy::new(SessionStore::new());
        let slow = trending_slow();

        let mut bars = flat_fast(60);
        let armed = make_candles(&bars);
        assert!(strategy.evaluate("KRW-BTC", &armed, &slow).is_none());
        let session = strategy.sessions().get("KRW-BTC").unwrap();
        assert!(session.active);
        assert_eq!(session.pullback_high, 100.1);

        bars.push((100.0, 100.4, 100.0, 100.3, 10.0));
        let breakout = make_candles(&bars);
        let signal = strategy.evaluate("KRW-BTC", &breakout, &slow);
        assert_eq!(signal.signal_type, SignalType::Buy);
        assert_eq!(
            signal.reason_codes,
            vec!["ADX_STRONG", "PULLBACK_NEAR_EMA", "BREAK_PULLBACK_HIGH"]
        );
        assert_eq!(signal.indicators["pullbackHigh"], serde_json::json!(100.1));
        assert!(!strategy.sessions().get("KRW-BTC").unwrap().active);
    }

    #[test]
    fn test_weak_adx_is_none() {
        let strategy = PullbackStrategy::new(SessionStore::new());
        let slow = make_candles(&flat_fast(60));
        let fast = make_candles(&flat_fast(60));
        assert!(strategy.evaluate("KRW-BTC", &fast, &slow).is_none());
        assert!(strategy.sessions().get("KRW-BTC").is_none());
    }

    #[test]
    fn test_close_below_ema_sells() {
        let strategy = PullbackStrategy::new(SessionStore::new());
        let mut bars = flat_fast(60);
        bars.push((100.0, 100.0, 97.0, 97.0, 10.0));
        let fast = make_candles(&bars);
        let signal = strategy.evaluate("KRW-BTC", &fast, &trending_slow());
        assert_eq!(signal.signal_type, SignalType::Sell);
        assert_eq!(signal.reason_codes, vec!["CLOSE_BELOW_EMA"]);
    }

    #[test]
    fn test_armed_pullback_expires() {
        let mut session = PullbackSession::default();
        let fast = make_candles(&flat_fast(30));
        session.active = true;
        session.armed_at = Some(fast[15].timestamp);
        assert_eq!(session.bars_since_armed(&fast), 14);
        session.armed_at = Some(fast[18].timestamp);
        assert_eq!(session.bars_since_armed(&fast), 11);
        assert!(session.bars_since_armed(&fast) > EXPIRE_BARS);
    }
}
