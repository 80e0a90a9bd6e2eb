//! Upbit Bot Engine — backtesting, live signal scanning and data sync
//!
//! Provides:
//! - Indicator library (SMA/EMA/RSI/MACD/ATR/ADX/Donchian/Bollinger)
//! - Bar-by-bar backtest engine with commission/slippage and metrics
//! - Backtest strategies (buy & hold, MA cross, RSI, Bollinger bands)
//! - Live-scan strategies V1..V4, including the EMA-trend state machine
//! - Rate-limited signal scanner over all KRW markets
//! - Upbit public API client and historical candle sync

pub mod api;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod indicators;
pub mod performance;
pub mod rate_limit;
pub mod scanner;
pub mod session;
pub mod store;
pub mod strategy;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use api::{ExchangeClient, MarketInfo, UpbitClient};
pub use engine::{run_on_candles, BacktestEngine, CandleSource};
pub use error::{EngineError, EngineResult};
pub use rate_limit::RateLimiter;
pub use scanner::{
    ScanProgress, ScanProgressSnapshot, ScanStatus, ScannerConfig, SignalScanResult,
    SignalScanner,
};
pub use session::SessionStore;
pub use store::{SqliteStore, StoredBacktest};
pub use strategy::{
    create_strategy, BacktestStrategyKind, EmaTrendConfig, EmaTrendState, EmaTrendStrategy,
    ScanStrategies, ScanStrategy, ScanStrategyCode, Strategy, StrategyCatalog,
};
pub use sync::{CandleSink, DataSync, SyncRequest, SyncState, SyncStatus, SyncTasks};
pub use types::*;
