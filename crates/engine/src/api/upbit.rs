//! Upbit public quotation API client (no authentication required)

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{ExchangeClient, MarketInfo, MAX_CANDLES_PER_REQUEST};
use crate::types::{Candle, Timeframe};

pub const DEFAULT_BASE_URL: &str = "https://api.upbit.com/v1";
/// Quote currency of the markets the bot trades
pub const QUOTE_PREFIX: &str = "KRW-";

#[derive(Debug, Deserialize)]
struct RawMarket {
    market: String,
    korean_name: String,
    english_name: String,
}

#[derive(Debug, Deserialize)]
struct RawCandle {
    market: String,
    candle_date_time_kst: NaiveDateTime,
    opening_price: f64,
    high_price: f64,
    low_price: f64,
    trade_price: f64,
    candle_acc_trade_volume: f64,
    #[serde(default)]
    candle_acc_trade_price: f64,
}

#[derive(Clone)]
pub struct UpbitClient {
    client: Client,
    base_url: String,
}

impl UpbitClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self.client.get(&url).query(query).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Upbit API error {}: {}", status, body);
        }

        Ok(response.json().await?)
    }
}

/// Keep KRW markets only
fn krw_markets(raw: Vec<RawMarket>) -> Vec<MarketInfo> {
    raw.into_iter()
        .filter(|m| m.market.starts_with(QUOTE_PREFIX))
        .map(|m| MarketInfo {
            market: m.market,
            korean_name: m.korean_name,
            english_name: m.english_name,
        })
        .collect()
}

/// Upbit returns newest first; flip to ascending.
fn into_candles(raw: Vec<RawCandle>, timeframe: Timeframe) -> Vec<Candle> {
    let mut candles: Vec<Candle> = raw
        .into_iter()
        .map(|r| Candle {
            market: r.market,
            timeframe,
            timestamp: r.candle_date_time_kst,
            open: r.opening_price,
            high: r.high_price,
            low: r.low_price,
            close: r.trade_price,
            volume: r.candle_acc_trade_volume,
            acc_trade_value: r.candle_acc_trade_price,
        })
        .collect();
    candles.reverse();
    candles
}

/// `to` is a KST wall-clock time; Upbit reads offset-less values as UTC.
fn format_to(to: NaiveDateTime) -> String {
    format!("{}+09:00", to.format("%Y-%m-%dT%H:%M:%S"))
}

#[async_trait]
impl ExchangeClient for UpbitClient {
    async fn markets(&self) -> Result<Vec<MarketInfo>> {
        let raw: Vec<RawMarket> = self
            .get_json("market/all", &[("isDetails", "false".to_string())])
            .await?;
        let markets = krw_markets(raw);
        debug!(count = markets.len(), "Fetched KRW markets");
        Ok(markets)
    }

    async fn candles(
        &self,
        market: &str,
        timeframe: Timeframe,
        to: Option<NaiveDateTime>,
        count: u32,
    ) -> Result<Vec<Candle>> {
        let mut query = vec![
            ("market", market.to_string()),
            ("count", count.clamp(1, MAX_CANDLES_PER_REQUEST).to_string()),
        ];
        if let Some(to) = to {
            query.push(("to", format_to(to)));
        }

        let path = format!("candles/{}", timeframe.upbit_path());
        debug!(market, timeframe = %timeframe, "Fetching candles from Upbit");
        let raw: Vec<RawCandle> = self.get_json(&path, &query).await?;
        Ok(into_candles(raw, timeframe))
    }
}
