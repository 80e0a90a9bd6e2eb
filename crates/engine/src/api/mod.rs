//! Exchange market-data clients

pub mod upbit;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::types::{Candle, Timeframe};

pub use upbit::UpbitClient;

/// Largest page the candle endpoints return
pub const MAX_CANDLES_PER_REQUEST: u32 = 200;

/// A tradable market as listed by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketInfo {
    /// e.g. "KRW-BTC"
    pub market: String,
    pub korean_name: String,
    pub english_name: String,
}

/// Read-only market data. Callers own request pacing.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// KRW quote markets only
    async fn markets(&self) -> Result<Vec<MarketInfo>>;

    /// Up to `count` candles ending at `to` (KST, exclusive) or at the latest
    /// bar when `to` is `None`, in ascending time order.
    async fn candles(
        &self,
        market: &str,
        timeframe: Timeframe,
        to: Option<NaiveDateTime>,
        count: u32,
    ) -> Result<Vec<Candle>>;
}
