//! V4: EMA trend following with a per-symbol state machine
//!
//! The 15m timeframe decides direction, the 5m timeframe times entries and
//! exits. Each symbol walks
//!
//! ```text
//! FLAT -> WAIT_PULLBACK -> WAIT_TRIGGER -> IN_LONG | IN_SHORT -> COOLDOWN -> FLAT
//! ```
//!
//! and at most one transition happens per evaluation, so an entry or exit is
//! signalled exactly once. Losing the trend (or a choppy market) drops every
//! state except IN_LONG / IN_SHORT back to FLAT.

pub mod conditions;
pub mod config;

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use conditions::{Conditions, Readings};
pub use config::EmaTrendConfig;

use super::{ScanStrategy, ScanStrategyCode};
use crate::session::SessionStore;
use crate::types::{Candle, SignalResult};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmaTrendState {
    #[default]
    Flat,
    WaitPullback,
    WaitTrigger,
    InLong,
    InShort,
    Cooldown,
}

impl EmaTrendState {
    pub const ALL: [EmaTrendState; 6] = [
        Self::Flat,
        Self::WaitPullback,
        Self::WaitTrigger,
        Self::InLong,
        Self::InShort,
        Self::Cooldown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flat => "FLAT",
            Self::WaitPullback => "WAIT_PULLBACK",
            Self::WaitTrigger => "WAIT_TRIGGER",
            Self::InLong => "IN_LONG",
            Self::InShort => "IN_SHORT",
            Self::Cooldown => "COOLDOWN",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Flat => "Flat",
            Self::WaitPullback => "Waiting for pullback",
            Self::WaitTrigger => "Waiting for trigger",
            Self::InLong => "Long",
            Self::InShort => "Short",
            Self::Cooldown => "Cooldown",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Flat => "No position, watching for a trend",
            Self::WaitPullback => "Trend confirmed, waiting for a pullback to EMA20",
            Self::WaitTrigger => "Pullback seen, waiting for an entry trigger",
            Self::InLong => "Holding a long position",
            Self::InShort => "Holding a short position",
            Self::Cooldown => "Position closed, re-entry blocked",
        }
    }

    /// States reachable from this one in a single evaluation
    pub fn successors(&self) -> &'static [EmaTrendState] {
        match self {
            Self::Flat => &[Self::WaitPullback],
            Self::WaitPullback => &[Self::WaitTrigger, Self::Flat],
            Self::WaitTrigger => &[Self::InLong, Self::InShort, Self::Flat],
            Self::InLong | Self::InShort => &[Self::Cooldown],
            Self::Cooldown => &[Self::Flat],
        }
    }

    pub fn in_position(&self) -> bool {
        matches!(self, Self::InLong | Self::InShort)
    }
}

/// Per-symbol memory of the state machine
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmaTrendSession {
    pub state: EmaTrendState,
    /// Evaluations spent in COOLDOWN
    pub cooldown_count: u32,
    pub entry_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    /// Candle time of the last state change
    pub changed_at: Option<NaiveDateTime>,
}

impl EmaTrendSession {
    fn transition(&mut self, next: EmaTrendState, at: NaiveDateTime) {
        if next != self.state {
            self.state = next;
            self.changed_at = Some(at);
        }
    }

    fn close_position(&mut self) {
        self.entry_price = None;
        self.stop_price = None;
        self.target_price = None;
        self.cooldown_count = 0;
    }
}

// ============================================================================
// Transitions
// ============================================================================

/// Advance `session` by one evaluation. Returns the entry/exit signal, if any,
/// without its indicator snapshot.
pub fn step(
    session: &mut EmaTrendSession,
    r: &Readings,
    c: &Conditions,
    config: &EmaTrendConfig,
    symbol: &str,
) -> Option<SignalResult> {
    let at = r.candle_time();
    let close = r.current.close;

    if !session.state.in_position() && (!c.has_trend() || c.chop) {
        if session.state != EmaTrendState::Flat {
            debug!(symbol, from = session.state.as_str(), chop = c.chop, "Trend lost, back to FLAT");
        }
        session.cooldown_count = 0;
        session.transition(EmaTrendState::Flat, at);
        return None;
    }

    match session.state {
        EmaTrendState::Flat => {
            info!(symbol, up = c.trend_up, "Trend detected");
            session.transition(EmaTrendState::WaitPullback, at);
            None
        }
        EmaTrendState::WaitPullback => {
            if c.pullback_long || c.pullback_short {
                info!(symbol, long = c.pullback_long, "Pullback detected");
                session.transition(EmaTrendState::WaitTrigger, at);
            }
            None
        }
        EmaTrendState::WaitTrigger => {
            let risk = config.stop_atr_multiplier * r.atr;
            if c.trigger_long && c.filter_long && c.trend_up {
                let stop = close - risk;
                let target = close + config.take_profit_ratio * (close - stop);
                session.entry_price = Some(close);
                session.stop_price = Some(stop);
                session.target_price = Some(target);
                session.transition(EmaTrendState::InLong, at);
                info!(symbol, entry = close, stop, target, "Long entry");
                Some(
                    SignalResult::buy()
                        .with_reasons(&["TREND_UP", "PULLBACK_DONE", "TRIGGER_LONG", "FILTER_PASS"])
                        .with_levels(close, Some(stop), Some(target)),
                )
            } else if c.trigger_short && c.filter_short && c.trend_down {
                let stop = close + risk;
                let target = close - config.take_profit_ratio * (stop - close);
                session.entry_price = Some(close);
                session.stop_price = Some(stop);
                session.target_price = Some(target);
                session.transition(EmaTrendState::InShort, at);
                info!(symbol, entry = close, stop, target, "Short entry");
                Some(
                    SignalResult::sell()
                        .with_reasons(&["TREND_DN", "PULLBACK_DONE", "TRIGGER_SHORT", "FILTER_PASS"])
                        .with_levels(close, Some(stop), Some(target)),
                )
            } else {
                None
            }
        }
        EmaTrendState::InLong => {
            let stop = session.stop_price?;
            let stop_hit = conditions::stop_long(close, stop, r.ema50_5);
            let reason = if stop_hit {
                "STOP_LOSS"
            } else if conditions::two_red(&r.current, &r.previous) && close < r.ema20_5 {
                "TWO_RED_EXIT"
            } else if close < r.ema20_5 {
                "TREND_EXIT"
            } else {
                return None;
            };
            info!(symbol, reason, close, "Long exit");
            session.close_position();
            session.transition(EmaTrendState::Cooldown, at);
            Some(SignalResult::sell().with_reasons(&[reason]))
        }
        EmaTrendState::InShort => {
            let stop = session.stop_price?;
            let stop_hit = conditions::stop_short(close, stop, r.ema50_5);
            let reason = if stop_hit {
                "STOP_LOSS"
            } else if conditions::two_green(&r.current, &r.previous) && close > r.ema20_5 {
                "TWO_GREEN_EXIT"
            } else if close > r.ema20_5 {
                "TREND_EXIT"
            } else {
                return None;
            };
            info!(symbol, reason, close, "Short exit");
            session.close_position();
            session.transition(EmaTrendState::Cooldown, at);
            Some(SignalResult::buy().with_reasons(&[reason]))
        }
        EmaTrendState::Cooldown => {
            session.cooldown_count += 1;
            if session.cooldown_count >= config.cooldown_bars {
                session.cooldown_count = 0;
                session.transition(EmaTrendState::Flat, at);
            }
            None
        }
    }
}

fn snapshot(
    signal: SignalResult,
    r: &Readings,
    c: &Conditions,
    state: EmaTrendState,
    prev_state: EmaTrendState,
) -> SignalResult {
    signal
        .at(r.candle_time())
        .with_indicator("state", state.as_str())
        .with_indicator("prevState", prev_state.as_str())
        .with_indicator("ema20_15", r.ema20_15)
        .with_indicator("ema50_15", r.ema50_15)
        .with_indicator("ema20_5", r.ema20_5)
        .with_indicator("ema50_5", r.ema50_5)
        .with_indicator("spread15", r.spread15)
        .with_indicator("spread5", r.spread5)
        .with_indicator("slopeEma20", r.slope_ema20)
        .with_indicator("slopeEma50", r.slope_ema50)
        .with_indicator("close5", r.current.close)
        .with_indicator("volume5", r.current.volume)
        .with_indicator("volumeMa5", r.volume_ma5)
        .with_indicator("atr", r.atr)
        .with_indicator("trendUp", c.trend_up)
        .with_indicator("trendDown", c.trend_down)
}

// ============================================================================
// Strategy
// ============================================================================

pub struct EmaTrendStrategy {
    config: EmaTrendConfig,
    sessions: SessionStore<EmaTrendSession>,
}

impl EmaTrendStrategy {
    pub fn new(config: EmaTrendConfig, sessions: SessionStore<EmaTrendSession>) -> Self {
        Self { config, sessions }
    }

    pub fn config(&self) -> &EmaTrendConfig {
        &self.config
    }

    /// Current state of `symbol`; FLAT if it was never evaluated.
    pub fn state(&self, symbol: &str) -> EmaTrendState {
        self.sessions
            .get(symbol)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    pub fn session(&self, symbol: &str) -> Option<EmaTrendSession> {
        self.sessions.get(symbol)
    }

    pub fn states(&self) -> BTreeMap<String, EmaTrendState> {
        self.sessions
            .snapshot()
            .into_iter()
            .map(|(symbol, s)| (symbol, s.state))
            .collect()
    }

    pub fn sessions(&self) -> &SessionStore<EmaTrendSession> {
        &self.sessions
    }

    pub fn reset(&self, symbol: &str) -> bool {
        info!(symbol, "EMA trend state reset");
        self.sessions.reset(symbol)
    }

    pub fn reset_all(&self) {
        info!("EMA trend states reset");
        self.sessions.reset_all();
    }
}

impl ScanStrategy for EmaTrendStrategy {
    fn code(&self) -> ScanStrategyCode {
        ScanStrategyCode::V4
    }

    fn name(&self) -> &'static str {
        "EMA Trend Following"
    }

    fn description(&self) -> &'static str {
        "15m EMA20/50 trend filter, 5m pullback to EMA20 and volume breakout, ATR stop"
    }

    fn warmup_bars(&self) -> usize {
        self.config.min_bars_fast
    }

    fn evaluate(&self, symbol: &str, fast: &[Candle], slow: &[Candle]) -> SignalResult {
        if fast.len() < self.config.min_bars_fast || slow.len() < self.config.min_bars_slow {
            return SignalResult::none();
        }
        let Some(readings) = Readings::compute(&self.config, fast, slow) else {
            return SignalResult::none();
        };
        let conditions = Conditions::evaluate(&readings, &self.config);

        self.sessions.update(symbol, |session| {
            let prev_state = session.state;
            match step(session, &readings, &conditions, &self.config, symbol) {
                Some(signal) => snapshot(signal, &readings, &conditions, session.state, prev_state),
                None => SignalResult::none(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::tests::make_candles;
    use crate::types::SignalType;

    type Bar = (f64, f64, f64, f64, f64);

    /// 60 rising 15m bars: EMA20 > EMA50, both sloping up
    fn uptrend_slow() -> Vec<Candle> {
        let bars: Vec<Bar> = (0..60)
            .map(|i| {
                let c = 100.0 + i as f64;
                (c - 0.5, c + 0.5, c - 1.0, c, 1000.0)
            })
            .collect();
        make_candles(&bars)
    }

    fn flat_slow() -> Vec<Candle> {
        make_candles(&[(100.0, 100.0, 100.0, 100.0, 1000.0); 60])
    }

    /// 100 gently rising 5m bars on constant volume
    fn rising_fast() -> Vec<Bar> {
        (0..100)
            .map(|i| {
                let c = 100.0 + i as f64 * 0.1;
                (c - 0.05, c + 0.05, c - 0.1, c, 100.0)
            })
            .collect()
    }

    fn pullback_bar() -> Bar {
        (109.9, 109.95, 108.9, 109.0, 50.0)
    }

    fn breakout_bar() -> Bar {
        (109.0, 110.6, 109.0, 110.5, 200.0)
    }

    fn strategy() -> EmaTrendStrategy {
        EmaTrendStrategy::new(EmaTrendConfig::default(), SessionStore::new())
    }

    #[test]
    fn test_state_successors() {
        assert_eq!(EmaTrendState::Flat.successors(), &[EmaTrendState::WaitPullback]);
        assert_eq!(EmaTrendState::InShort.successors(), &[EmaTrendState::Cooldown]);
        assert!(EmaTrendState::InLong.in_position());
        assert_eq!(
            serde_json::to_value(EmaTrendState::WaitTrigger).unwrap(),
            serde_json::json!("WAIT_TRIGGER")
        );
    }

    #[test]
    fn test_full_long_cycle_emits_one_buy() {
        let strategy = strategy();
        let slow = uptrend_slow();
        let mut bars = rising_fast();

        let first = strategy.evaluate("KRW-BTC", &make_candles(&bars), &slow);
        assert!(first.is_none());
        assert_eq!(strategy.state("KRW-BTC"), EmaTrendState::WaitPullback);

        bars.push(pullback_bar());
        let second = strategy.evaluate("KRW-BTC", &make_candles(&bars), &slow);
        assert!(second.is_none());
        assert_eq!(strategy.state("KRW-BTC"), EmaTrendState::WaitTrigger);

        bars.push(breakout_bar());
        let fast = make_candles(&bars);
        let entry = strategy.evaluate("KRW-BTC", &fast, &slow);
        assert_eq!(entry.signal_type, SignalType::Buy);
        assert_eq!(
            entry.reason_codes,
            vec!["TREND_UP", "PULLBACK_DONE", "TRIGGER_LONG", "FILTER_PASS"]
        );
        assert_eq!(entry.entry_price, Some(110.5));
        assert_eq!(entry.candle_time, Some(fast.last().unwrap().timestamp));
        assert_eq!(entry.indicators["state"], serde_json::json!("IN_LONG"));
        assert_eq!(entry.indicators["prevState"], serde_json::json!("WAIT_TRIGGER"));
        assert_eq!(entry.indicators.len(), 16);
        let stop = entry.stop_price.unwrap();
        let target = entry.target_price.unwrap();
        assert!((target - 110.5 - (110.5 - stop)).abs() < 1e-9);
        assert_eq!(strategy.state("KRW-BTC"), EmaTrendState::InLong);

        // Same window again: holding, no duplicate entry
        assert!(strategy.evaluate("KRW-BTC", &fast, &slow).is_none());
        assert_eq!(strategy.state("KRW-BTC"), EmaTrendState::InLong);
    }

    #[test]
    fn test_stop_exit_then_cooldown_to_flat() {
        let strategy = strategy();
        let slow = uptrend_slow();
        let mut bars = rising_fast();
        strategy.evaluate("KRW-ETH", &make_candles(&bars), &slow);
        bars.push(pullback_bar());
        strategy.evaluate("KRW-ETH", &make_candles(&bars), &slow);
        bars.push(breakout_bar());
        strategy.evaluate("KRW-ETH", &make_candles(&bars), &slow);
        assert_eq!(strategy.state("KRW-ETH"), EmaTrendState::InLong);

        bars.push((110.5, 110.5, 108.0, 108.5, 100.0));
        let fast = make_candles(&bars);
        let exit = strategy.evaluate("KRW-ETH", &fast, &slow);
        assert_eq!(exit.signal_type, SignalType::Sell);
        assert_eq!(exit.reason_codes, vec!["STOP_LOSS"]);
        assert_eq!(strategy.state("KRW-ETH"), EmaTrendState::Cooldown);
        assert_eq!(strategy.session("KRW-ETH").unwrap().entry_price, None);

        for _ in 0..2 {
            assert!(strategy.evaluate("KRW-ETH", &fast, &slow).is_none());
            assert_eq!(strategy.state("KRW-ETH"), EmaTrendState::Cooldown);
        }
        assert!(strategy.evaluate("KRW-ETH", &fast, &slow).is_none());
        assert_eq!(strategy.state("KRW-ETH"), EmaTrendState::Flat);
    }

    #[test]
    fn test_no_trend_keeps_flat() {
        let strategy = strategy();
        let fast = make_candles(&rising_fast());
        assert!(strategy.evaluate("KRW-XRP", &fast, &flat_slow()).is_none());
        assert_eq!(strategy.state("KRW-XRP"), EmaTrendState::Flat);
    }

    #[test]
    fn test_trend_loss_collapses_waiting_state() {
        let strategy = strategy();
        let fast = make_candles(&rising_fast());
        strategy.evaluate("KRW-SOL", &fast, &uptrend_slow());
        assert_eq!(strategy.state("KRW-SOL"), EmaTrendState::WaitPullback);
        strategy.evaluate("KRW-SOL", &fast, &flat_slow());
        assert_eq!(strategy.state("KRW-SOL"), EmaTrendState::Flat);
    }

    #[test]
    fn test_position_survives_trend_loss() {
        let mut session = EmaTrendSession {
            state: EmaTrendState::InLong,
            entry_price: Some(100.0),
            stop_price: Some(90.0),
            ..Default::default()
        };
        let fast = make_candles(&rising_fast());
        let config = EmaTrendConfig::default();
        let readings = Readings::compute(&config, &fast, &flat_slow()).unwrap();
        let conditions = Conditions::evaluate(&readings, &config);
        assert!(!conditions.has_trend());

        let signal = step(&mut session, &readings, &conditions, &config, "KRW-BTC");
        assert!(signal.is_none());
        assert_eq!(session.state, EmaTrendState::InLong);
    }

    #[test]
    fn test_short_history_is_none() {
        let strategy = strategy();
        let fast = make_candles(&rising_fast()[..50]);
        assert!(strategy.evaluate("KRW-BTC", &fast, &uptrend_slow()).is_none());
        assert!(strategy.session("KRW-BTC").is_none());
    }

    #[test]
    fn test_reset_clears_symbol() {
        let strategy = strategy();
        let fast = make_candles(&rising_fast());
        strategy.evaluate("KRW-BTC", &fast, &uptrend_slow());
        strategy.evaluate("KRW-ETH", &fast, &uptrend_slow());
        assert_eq!(strategy.states().len(), 2);

        assert!(strategy.reset("KRW-BTC"));
        assert_eq!(strategy.state("KRW-BTC"), EmaTrendState::Flat);
        assert_eq!(strategy.states().len(), 1);

        strategy.reset_all();
        assert!(strategy.states().is_empty());
    }
}
