//! Engine error type

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No historical data found for {market} {timeframe} between {start} and {end}")]
    NoData {
        market: String,
        timeframe: String,
        start: String,
        end: String,
    },

    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Invalid strategy parameters: {0}")]
    InvalidParams(String),

    #[error("Unsupported timeframe: {0}")]
    UnsupportedTimeframe(String),

    #[error("Invalid date range: {start} to {end}")]
    InvalidRange { start: String, end: String },

    #[error("Candle source error: {0}")]
    Source(String),

    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Scan already running")]
    ScanInProgress,

    #[error(transparent)]
    Db(#[from] persistence::DbError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
