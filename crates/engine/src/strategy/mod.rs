//! Strategy abstractions, factory and catalog
//!
//! Two families share this module:
//! - backtest strategies ([`Strategy`]) emit BUY/SELL/HOLD per candle inside a
//!   backtest run;
//! - live-scan strategies ([`ScanStrategy`]) evaluate the latest fast/slow
//!   candle windows of one market and return a [`SignalResult`].

pub mod backtest;
pub mod donchian;
pub mod ema_trend;
pub mod pullback;
pub mod reversal;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::context::BacktestContext;
use crate::error::{EngineError, EngineResult};
use crate::session::SessionStore;
use crate::types::{Candle, Signal, SignalResult};

pub use backtest::{
    BollingerBandsParams, BollingerBandsStrategy, BuyAndHoldStrategy, MaCrossParams,
    MaCrossStrategy, RsiParams, RsiStrategy,
};
pub use donchian::DonchianBreakoutStrategy;
pub use ema_trend::{EmaTrendConfig, EmaTrendSession, EmaTrendState, EmaTrendStrategy};
pub use pullback::{PullbackSession, PullbackStrategy};
pub use reversal::ReversalStrategy;

// ============================================================================
// Traits
// ============================================================================

/// Bar-by-bar strategy driven by the backtest engine
pub trait Strategy: Send {
    /// Display name including parameters, e.g. "MA Cross (5/20)"
    fn name(&self) -> String;

    /// Called once before the first bar with the full candle series.
    fn initialize(&mut self, ctx: &BacktestContext, candles: &[Candle]);

    /// Decide on bar `index`. Must only look at `candles[..=index]`.
    fn generate_signal(&mut self, index: usize, candles: &[Candle], ctx: &BacktestContext)
        -> Signal;
}

/// Strategy evaluated against the latest candles of a live market
pub trait ScanStrategy: Send + Sync {
    fn code(&self) -> ScanStrategyCode;

    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Minimum number of fast-timeframe candles required before evaluation
    fn warmup_bars(&self) -> usize;

    /// `fast` and `slow` are ascending candle windows (5m and 15m by default).
    fn evaluate(&self, symbol: &str, fast: &[Candle], slow: &[Candle]) -> SignalResult;
}

// ============================================================================
// Backtest strategy factory
// ============================================================================

/// Backtest strategy variants addressable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BacktestStrategyKind {
    BuyAndHold,
    MaCross,
    Rsi,
    BollingerBands,
}

impl BacktestStrategyKind {
    pub const ALL: [BacktestStrategyKind; 4] = [
        Self::BuyAndHold,
        Self::MaCross,
        Self::Rsi,
        Self::BollingerBands,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuyAndHold => "BUY_AND_HOLD",
            Self::MaCross => "MA_CROSS",
            Self::Rsi => "RSI",
            Self::BollingerBands => "BOLLINGER_BANDS",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::BuyAndHold => "Buy and Hold",
            Self::MaCross => "Moving Average Cross",
            Self::Rsi => "RSI",
            Self::BollingerBands => "Bollinger Bands",
        }
    }

    /// Case-insensitive lookup. An empty name means BUY_AND_HOLD.
    pub fn from_name(name: &str) -> EngineResult<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(Self::BuyAndHold);
        }
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| EngineError::UnknownStrategy(name.to_string()))
    }

    pub fn default_params(&self) -> serde_json::Value {
        match self {
            Self::BuyAndHold => Ok(serde_json::json!({})),
            Self::MaCross => serde_json::to_value(MaCrossParams::default()),
            Self::Rsi => serde_json::to_value(RsiParams::default()),
            Self::BollingerBands => serde_json::to_value(BollingerBandsParams::default()),
        }
        .unwrap_or_default()
    }
}

fn parse_params<P: DeserializeOwned + Default>(
    params: &serde_json::Map<String, serde_json::Value>,
) -> EngineResult<P> {
    if params.is_empty() {
        return Ok(P::default());
    }
    serde_json::from_value(serde_json::Value::Object(params.clone()))
        .map_err(|e| EngineError::InvalidParams(e.to_string()))
}

/// Build a backtest strategy from its name and a parameter map.
///
/// Missing parameters take their defaults; unknown names and parameter sets
/// that violate a strategy's invariants are errors.
pub fn create_strategy(
    name: &str,
    params: &serde_json::Map<String, serde_json::Value>,
) -> EngineResult<Box<dyn Strategy>> {
    let strategy: Box<dyn Strategy> = match BacktestStrategyKind::from_name(name)? {
        BacktestStrategyKind::BuyAndHold => Box::new(BuyAndHoldStrategy::default()),
        BacktestStrategyKind::MaCross => Box::new(MaCrossStrategy::new(parse_params(params)?)?),
        BacktestStrategyKind::Rsi => Box::new(RsiStrategy::new(parse_params(params)?)?),
        BacktestStrategyKind::BollingerBands => {
            Box::new(BollingerBandsStrategy::new(parse_params(params)?)?)
        }
    };
    Ok(strategy)
}

// ============================================================================
// Scan strategy registry
// ============================================================================

/// Codes of the live-scan strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanStrategyCode {
    V1,
    V2,
    V3,
    V4,
}

impl ScanStrategyCode {
    pub const ALL: [ScanStrategyCode; 4] = [Self::V1, Self::V2, Self::V3, Self::V4];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "V1",
            Self::V2 => "V2",
            Self::V3 => "V3",
            Self::V4 => "V4",
        }
    }
}

impl fmt::Display for ScanStrategyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStrategyCode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| EngineError::UnknownStrategy(s.to_string()))
    }
}

/// The live-scan strategies wired to their shared per-symbol session stores
#[derive(Clone)]
pub struct ScanStrategies {
    pub donchian: Arc<DonchianBreakoutStrategy>,
    pub pullback: Arc<PullbackStrategy>,
    pub reversal: Arc<ReversalStrategy>,
    pub ema_trend: Arc<EmaTrendStrategy>,
}

impl ScanStrategies {
    pub fn new(
        pullback_sessions: SessionStore<PullbackSession>,
        ema_sessions: SessionStore<EmaTrendSession>,
        ema_config: EmaTrendConfig,
    ) -> Self {
        Self {
            donchian: Arc::new(DonchianBreakoutStrategy::default()),
            pullback: Arc::new(PullbackStrategy::new(pullback_sessions)),
            reversal: Arc::new(ReversalStrategy::default()),
            ema_trend: Arc::new(EmaTrendStrategy::new(ema_config, ema_sessions)),
        }
    }

    pub fn get(&self, code: ScanStrategyCode) -> Arc<dyn ScanStrategy> {
        match code {
            ScanStrategyCode::V1 => self.donchian.clone() as Arc<dyn ScanStrategy>,
            ScanStrategyCode::V2 => self.pullback.clone() as Arc<dyn ScanStrategy>,
            ScanStrategyCode::V3 => self.reversal.clone() as Arc<dyn ScanStrategy>,
            ScanStrategyCode::V4 => self.ema_trend.clone() as Arc<dyn ScanStrategy>,
        }
    }
}

impl Default for ScanStrategies {
    fn default() -> Self {
        Self::new(
            SessionStore::new(),
            SessionStore::new(),
            EmaTrendConfig::default(),
        )
    }
}

// ============================================================================
// Catalog
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct BacktestStrategyInfo {
    pub name: &'static str,
    pub display_name: &'static str,
    pub default_params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanStrategyInfo {
    pub code: ScanStrategyCode,
    pub name: &'static str,
    pub description: &'static str,
    pub warmup_bars: usize,
}

/// Everything a client needs to pick a strategy
#[derive(Debug, Clone, Serialize)]
pub struct StrategyCatalog {
    pub backtest: Vec<BacktestStrategyInfo>,
    pub scan: Vec<ScanStrategyInfo>,
}

impl StrategyCatalog {
    pub fn build(scan: &ScanStrategies) -> Self {
        let backtest = BacktestStrategyKind::ALL
            .iter()
            .map(|k| BacktestStrategyInfo {
                name: k.as_str(),
                display_name: k.display_name(),
                default_params: k.default_params(),
            })
            .collect();
        let scan = ScanStrategyCode::ALL
            .iter()
            .map(|&code| {
                let s = scan.get(code);
                ScanStrategyInfo {
                    code,
                    name: s.name(),
                    description: s.description(),
                    warmup_bars: s.warmup_bars(),
                }
            })
            .collect();
        Self { backtest, scan }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_kind_lookup_is_case_insensitive() {
        assert_eq!(
            BacktestStrategyKind::from_name("ma_cross").unwrap(),
            BacktestStrategyKind::MaCross
        );
        assert_eq!(
            BacktestStrategyKind::from_name("").unwrap(),
            BacktestStrategyKind::BuyAndHold
        );
        assert!(matches!(
            BacktestStrategyKind::from_name("MOON"),
            Err(EngineError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn test_create_strategy_with_defaults() {
        let empty = serde_json::Map::new();
        assert_eq!(create_strategy("BUY_AND_HOLD", &empty).unwrap().name(), "Buy and Hold");
        assert_eq!(create_strategy("MA_CROSS", &empty).unwrap().name(), "MA Cross (5/20)");
        assert_eq!(create_strategy("rsi", &empty).unwrap().name(), "RSI (14, 30/70)");
        assert_eq!(
            create_strategy("BOLLINGER_BANDS", &empty).unwrap().name(),
            "Bollinger Bands (20, 2.0)"
        );
    }

    #[test]
    fn test_create_strategy_with_params() {
        let strategy =
            create_strategy("MA_CROSS", &params(json!({"shortPeriod": 3, "longPeriod": 10})))
                .unwrap();
        assert_eq!(strategy.name(), "MA Cross (3/10)");

        let partial = create_strategy("RSI", &params(json!({"oversoldLevel": 25}))).unwrap();
        assert_eq!(partial.name(), "RSI (14, 25/70)");
    }

    #[test]
    fn test_create_strategy_rejects_invalid_params() {
        let bad_ma =
            create_strategy("MA_CROSS", &params(json!({"shortPeriod": 20, "longPeriod": 5})));
        assert!(matches!(bad_ma, Err(EngineError::InvalidParams(_))));

        let bad_rsi = create_strategy(
            "RSI",
            &params(json!({"oversoldLevel": 80, "overboughtLevel": 70})),
        );
        assert!(matches!(bad_rsi, Err(EngineError::InvalidParams(_))));

        let wrong_type = create_strategy("MA_CROSS", &params(json!({"shortPeriod": "fast"})));
        assert!(matches!(wrong_type, Err(EngineError::InvalidParams(_))));
    }

    #[test]
    fn test_create_strategy_coerces_numeric_text() {
        let strategy = create_strategy(
            "MA_CROSS",
            &params(json!({"shortPeriod": "5", "longPeriod": 20.0})),
        )
        .unwrap();
        assert_eq!(strategy.name(), "MA Cross (5/20)");

        let rsi = create_strategy(
            "RSI",
            &params(json!({"period": "10", "oversoldLevel": "25", "overboughtLevel": 75.0})),
        )
        .unwrap();
        assert_eq!(rsi.name(), "RSI (10, 25/75)");

        let bands = create_strategy("BOLLINGER_BANDS", &params(json!({"period": " 30 ", "k": "2.5"})))
            .unwrap();
        assert_eq!(bands.name(), "Bollinger Bands (30, 2.5)");

        let negative = create_strategy("MA_CROSS", &params(json!({"shortPeriod": -3})));
        assert!(matches!(negative, Err(EngineError::InvalidParams(_))));
    }

    #[test]
    fn test_default_params_per_kind() {
        assert_eq!(BacktestStrategyKind::BuyAndHold.default_params(), json!({}));
        assert_eq!(
            BacktestStrategyKind::MaCross.default_params(),
            json!({"shortPeriod": 5, "longPeriod": 20})
        );
        assert_eq!(BacktestStrategyKind::Rsi.default_params()["period"], json!(14));
        assert_eq!(
            BacktestStrategyKind::BollingerBands.default_params()["stdDevMultiplier"],
            json!(2.0)
        );
    }

    #[test]
    fn test_scan_code_parse() {
        assert_eq!("v4".parse::<ScanStrategyCode>().unwrap(), ScanStrategyCode::V4);
        assert!("V9".parse::<ScanStrategyCode>().is_err());
    }

    #[test]
    fn test_catalog_lists_everything() {
        let catalog = StrategyCatalog::build(&ScanStrategies::default());
        assert_eq!(catalog.backtest.len(), 4);
        assert_eq!(catalog.scan.len(), 4);
        assert_eq!(catalog.backtest[1].default_params["shortPeriod"], json!(5));
        assert_eq!(catalog.scan[0].warmup_bars, 78);
        assert_eq!(catalog.scan[3].warmup_bars, 100);
    }
}
