//! SQLite-backed candle source, candle sink and backtest result store

use async_trait::async_trait;
use chrono::NaiveDateTime;
use persistence::repository::{
    AvailableMarketData, BacktestRecord, BacktestRepository, BacktestSummary, BacktestTradeRecord,
    CandleRecord, CandleRepository, SyncHistoryRecord, SyncHistoryRepository,
};
use persistence::SqlitePool;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::CandleSource;
use crate::error::EngineResult;
use crate::sync::{CandleSink, SyncRequest, SyncStatus};
use crate::types::*;

/// A backtest run as stored, with its database id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredBacktest {
    pub id: i64,
    /// Unix seconds
    pub created_at: Option<i64>,
    #[serde(flatten)]
    pub result: BacktestResult,
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a finished run with its trades. Returns the new id.
    pub async fn save_backtest(&self, result: &BacktestResult) -> EngineResult<i64> {
        let record = backtest_record(result)?;
        let trades: Vec<BacktestTradeRecord> = result.trades.iter().map(trade_record).collect();

        let id = BacktestRepository::new(&self.pool)
            .save(&record, &trades)
            .await?;
        info!(id, name = %result.config.name, trades = trades.len(), "Backtest saved");
        Ok(id)
    }

    pub async fn load_backtest(&self, id: i64) -> EngineResult<Option<StoredBacktest>> {
        let repo = BacktestRepository::new(&self.pool);
        let Some(record) = repo.get(id).await? else {
            return Ok(None);
        };
        let trades = repo.trades(id).await?;

        let config: BacktestConfig = serde_json::from_str(&record.config_json)?;
        let equity_curve: Vec<EquityPoint> = serde_json::from_str(&record.equity_curve_json)?;
        let metrics = record.total_return.map(|total_return| PerformanceMetrics {
            total_return,
            annual_return: record.annual_return.unwrap_or_default(),
            max_drawdown: record.max_drawdown.unwrap_or_default(),
            sharpe_ratio: record.sharpe_ratio.unwrap_or_default(),
            win_rate: record.win_rate.unwrap_or_default(),
            total_trades: record.total_trades.unwrap_or_default() as u32,
            winning_trades: record.winning_trades.unwrap_or_default() as u32,
            losing_trades: record.losing_trades.unwrap_or_default() as u32,
            avg_profit: record.avg_profit.unwrap_or_default(),
            avg_loss: record.avg_loss.unwrap_or_default(),
            final_capital: record.final_capital.unwrap_or_default(),
            peak_capital: record.peak_capital.unwrap_or_default(),
        });

        Ok(Some(StoredBacktest {
            id,
            created_at: record.created_at,
            result: BacktestResult {
                config,
                status: parse_status(&record.status),
                strategy_display_name: record.strategy_display_name,
                metrics,
                trades: trades.into_iter().map(trade_from_record).collect(),
                equity_curve,
                error_message: record.error_message,
                execution_time_ms: record.execution_time_ms.max(0) as u64,
                completed_at: record.completed_at,
            },
        }))
    }

    pub async fn recent_backtests(&self, limit: i64) -> EngineResult<Vec<BacktestSummary>> {
        Ok(BacktestRepository::new(&self.pool).list_recent(limit).await?)
    }

    pub async fn delete_backtest(&self, id: i64) -> EngineResult<bool> {
        Ok(BacktestRepository::new(&self.pool).delete(id).await?)
    }

    /// Stored candle coverage per (market, timeframe)
    pub async fn available_market_data(&self) -> EngineResult<Vec<AvailableMarketData>> {
        Ok(CandleRepository::new(&self.pool).available().await?)
    }

    pub async fn candle_count(&self, market: &str, timeframe: Timeframe) -> EngineResult<i64> {
        Ok(CandleRepository::new(&self.pool)
            .count(market, timeframe.as_str())
            .await?)
    }

    pub async fn sync_history(&self, limit: i64) -> EngineResult<Vec<SyncHistoryRecord>> {
        Ok(SyncHistoryRepository::new(&self.pool).recent(limit).await?)
    }
}

#[async_trait]
impl CandleSource for SqliteStore {
    async fn load_candles(
        &self,
        market: &str,
        timeframe: Timeframe,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> EngineResult<Vec<Candle>> {
        let records = CandleRepository::new(&self.pool)
            .find_range(market, timeframe.as_str(), start, end)
            .await?;
        debug!(market, timeframe = %timeframe, rows = records.len(), "Candles loaded");

        Ok(records
            .into_iter()
            .map(|r| Candle {
                market: r.market,
                timeframe,
                timestamp: r.timestamp,
                open: r.open,
                high: r.high,
                low: r.low,
                close: r.close,
                volume: r.volume,
                acc_trade_value: r.acc_trade_value,
            })
            .collect())
    }
}

#[async_trait]
impl CandleSink for SqliteStore {
    async fn save_candles(&self, candles: &[Candle]) -> EngineResult<usize> {
        let records: Vec<CandleRecord> = candles
            .iter()
            .map(|c| CandleRecord {
                market: c.market.clone(),
                timeframe: c.timeframe.as_str().to_string(),
                timestamp: c.timestamp,
                open: c.open,
                high: c.high,
                low: c.low,
                close: c.close,
                volume: c.volume,
                acc_trade_value: c.acc_trade_value,
            })
            .collect();
        Ok(CandleRepository::new(&self.pool).insert_many(&records).await?)
    }

    async fn record_sync(&self, request: &SyncRequest, status: &SyncStatus) -> EngineResult<()> {
        let entry = SyncHistoryRecord {
            id: None,
            task_id: status.task_id.clone(),
            market: request.market.clone(),
            timeframe: request.timeframe.as_str().to_string(),
            start_date: request.start_date,
            end_date: request.end_date,
            status: status.status.as_str().to_string(),
            records_saved: status.records_saved as i64,
            message: status.message.clone(),
            started_at: status.started_at,
            finished_at: status.finished_at.unwrap_or(status.started_at),
        };
        SyncHistoryRepository::new(&self.pool).record(&entry).await?;
        Ok(())
    }
}

fn backtest_record(result: &BacktestResult) -> EngineResult<BacktestRecord> {
    let config = &result.config;
    let m = result.metrics.as_ref();
    Ok(BacktestRecord {
        id: None,
        name: config.name.clone(),
        market: config.market.clone(),
        timeframe: config.timeframe.as_str().to_string(),
        strategy_name: config.strategy_name.clone(),
        strategy_display_name: result.strategy_display_name.clone(),
        start_date: config.start_date,
        end_date: config.end_date,
        initial_capital: config.initial_capital.to_string(),
        buy_fraction: config.buy_fraction.to_string(),
        config_json: serde_json::to_string(config)?,
        status: result.status.as_str().to_string(),
        total_return: m.map(|m| m.total_return),
        annual_return: m.map(|m| m.annual_return),
        max_drawdown: m.map(|m| m.max_drawdown),
        sharpe_ratio: m.map(|m| m.sharpe_ratio),
        win_rate: m.map(|m| m.win_rate),
        total_trades: m.map(|m| m.total_trades as i64),
        winning_trades: m.map(|m| m.winning_trades as i64),
        losing_trades: m.map(|m| m.losing_trades as i64),
        avg_profit: m.map(|m| m.avg_profit),
        avg_loss: m.map(|m| m.avg_loss),
        final_capital: m.map(|m| m.final_capital),
        peak_capital: m.map(|m| m.peak_capital),
        equity_curve_json: serde_json::to_string(&result.equity_curve)?,
        error_message: result.error_message.clone(),
        execution_time_ms: result.execution_time_ms as i64,
        completed_at: result.completed_at,
        created_at: None,
    })
}

fn trade_record(t: &Trade) -> BacktestTradeRecord {
    BacktestTradeRecord {
        id: None,
        backtest_id: 0,
        timestamp: t.timestamp,
        side: t.side.as_str().to_string(),
        price: t.price,
        volume: t.volume,
        total_amount: t.total_amount,
        commission: t.commission,
        reason: t.reason.clone(),
        balance_before: t.balance_before,
        balance_after: t.balance_after,
        portfolio_value: t.portfolio_value,
        profit_pct: t.profit_pct,
    }
}

fn trade_from_record(r: BacktestTradeRecord) -> Trade {
    Trade {
        timestamp: r.timestamp,
        side: if r.side == "SELL" {
            TradeSide::Sell
        } else {
            TradeSide::Buy
        },
        price: r.price,
        volume: r.volume,
        total_amount: r.total_amount,
        commission: r.commission,
        reason: r.reason,
        balance_before: r.balance_before,
        balance_after: r.balance_after,
        portfolio_value: r.portfolio_value,
        profit_pct: r.profit_pct,
    }
}

fn parse_status(s: &str) -> BacktestStatus {
    match s {
        "RUNNING" => BacktestStatus::Running,
        "COMPLETED" => BacktestStatus::Completed,
        "FAILED" => BacktestStatus::Failed,
        _ => BacktestStatus::NotStarted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BacktestEngine;
    use crate::indicators::tests::make_candles;
    use crate::sync::SyncState;
    use chrono::NaiveDate;
    use persistence::Database;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    async fn store() -> SqliteStore {
        let db = Database::in_memory().await.unwrap();
        SqliteStore::new(db.pool_clone())
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn rising() -> Vec<Candle> {
        let bars: Vec<_> = (0..30)
            .map(|i| {
                let close = 100.0 + i as f64;
                (close, close + 1.0, close - 1.0, close, 10.0)
            })
            .collect();
        make_candles(&bars)
    }

    fn config(strategy: &str) -> BacktestConfig {
        BacktestConfig {
            name: "stored".to_string(),
            market: "KRW-BTC".to_string(),
            timeframe: Timeframe::M1,
            start_date: day(1),
            end_date: day(1),
            initial_capital: dec!(1000000),
            strategy_name: strategy.to_string(),
            strategy_params: serde_json::Map::new(),
            commission_rate: dec!(0.0005),
            slippage_rate: dec!(0.0001),
            buy_fraction: dec!(0.99),
        }
    }

    #[tokio::test]
    async fn test_candles_round_trip_through_source() {
        let store = store().await;
        let candles = rising();
        assert_eq!(store.save_candles(&candles).await.unwrap(), 30);
        assert_eq!(store.save_candles(&candles[..10]).await.unwrap(), 0);

        let start = day(1).and_hms_opt(0, 5, 0).unwrap();
        let end = day(1).and_hms_opt(0, 9, 0).unwrap();
        let loaded = store
            .load_candles("KRW-BTC", Timeframe::M1, start, end)
            .await
            .unwrap();
        assert_eq!(loaded, candles[5..10].to_vec());
        assert_eq!(store.candle_count("KRW-BTC", Timeframe::M1).await.unwrap(), 30);

        let available = store.available_market_data().await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].timeframe, "1m");
        assert_eq!(available[0].record_count, 30);
    }

    #[tokio::test]
    async fn test_backtest_from_store_saves_and_reloads() {
        let store = Arc::new(store().await);
        store.save_candles(&rising()).await.unwrap();

        let engine = BacktestEngine::new(store.clone());
        let result = engine.run(config("BUY_AND_HOLD")).await;
        assert_eq!(result.status, BacktestStatus::Completed);

        let id = store.save_backtest(&result).await.unwrap();
        let stored = store.load_backtest(id).await.unwrap().unwrap();
        assert_eq!(stored.id, id);
        assert!(stored.created_at.is_some());
        assert_eq!(stored.result.status, BacktestStatus::Completed);
        assert_eq!(stored.result.trades, result.trades);
        assert_eq!(stored.result.equity_curve.len(), 30);
        assert_eq!(stored.result.config.buy_fraction, dec!(0.99));
        assert_eq!(
            stored.result.metrics.unwrap().total_trades,
            result.metrics.unwrap().total_trades
        );

        let recent = store.recent_backtests(5).await.unwrap();
        assert_eq!(recent[0].id, id);
        assert!(store.delete_backtest(id).await.unwrap());
        assert!(store.load_backtest(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_backtest_is_stored_without_metrics() {
        let store = Arc::new(store().await);
        let engine = BacktestEngine::new(store.clone());
        let result = engine.run(config("BUY_AND_HOLD")).await;
        assert_eq!(result.status, BacktestStatus::Failed);

        let id = store.save_backtest(&result).await.unwrap();
        let stored = store.load_backtest(id).await.unwrap().unwrap();
        assert_eq!(stored.result.status, BacktestStatus::Failed);
        assert!(stored.result.metrics.is_none());
        assert!(stored
            .result
            .error_message
            .unwrap()
            .starts_with("No historical data found"));
    }

    #[tokio::test]
    async fn test_sync_history_is_recorded() {
        let store = store().await;
        let request = SyncRequest {
            market: "KRW-BTC".to_string(),
            timeframe: Timeframe::H1,
            start_date: day(1),
            end_date: day(2),
        };
        let started = day(3).and_hms_opt(10, 0, 0).unwrap();
        let status = SyncStatus {
            task_id: "sync-1".to_string(),
            market: request.market.clone(),
            timeframe: request.timeframe,
            status: SyncState::Completed,
            progress: 100.0,
            records_processed: 48,
            records_saved: 40,
            estimated_total: 48,
            message: Some("Synced 48 candles (40 new)".to_string()),
            started_at: started,
            finished_at: Some(started + chrono::Duration::seconds(3)),
        };

        store.record_sync(&request, &status).await.unwrap();
        let history = store.sync_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, "COMPLETED");
        assert_eq!(history[0].records_saved, 40);
        assert_eq!(history[0].timeframe, "1h");
    }
}
