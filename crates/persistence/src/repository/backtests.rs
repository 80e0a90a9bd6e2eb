//! Backtest result repository: one row per run plus its trades

use crate::DbResult;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A persisted backtest run. Metrics are `None` for failed runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BacktestRecord {
    pub id: Option<i64>,
    pub name: String,
    pub market: String,
    pub timeframe: String,
    pub strategy_name: String,
    pub strategy_display_name: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Decimal rendered as text
    pub initial_capital: String,
    pub buy_fraction: String,
    /// Full run configuration as JSON
    pub config_json: String,
    pub status: String,
    pub total_return: Option<f64>,
    pub annual_return: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub win_rate: Option<f64>,
    pub total_trades: Option<i64>,
    pub winning_trades: Option<i64>,
    pub losing_trades: Option<i64>,
    pub avg_profit: Option<f64>,
    pub avg_loss: Option<f64>,
    pub final_capital: Option<f64>,
    pub peak_capital: Option<f64>,
    pub equity_curve_json: String,
    pub error_message: Option<String>,
    pub execution_time_ms: i64,
    pub completed_at: Option<NaiveDateTime>,
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BacktestTradeRecord {
    pub id: Option<i64>,
    pub backtest_id: i64,
    pub timestamp: NaiveDateTime,
    pub side: String,
    pub price: f64,
    pub volume: f64,
    pub total_amount: f64,
    pub commission: f64,
    pub reason: String,
    pub balance_before: f64,
    pub balance_after: f64,
    pub portfolio_value: f64,
    pub profit_pct: Option<f64>,
}

/// Short listing row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BacktestSummary {
    pub id: i64,
    pub name: String,
    pub market: String,
    pub timeframe: String,
    pub strategy_name: String,
    pub status: String,
    pub total_return: Option<f64>,
    pub created_at: Option<i64>,
}

pub struct BacktestRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BacktestRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a run and its trades in one transaction. Returns the new id;
    /// `backtest_id` of the given trades is ignored.
    pub async fn save(
        &self,
        record: &BacktestRecord,
        trades: &[BacktestTradeRecord],
    ) -> DbResult<i64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"INSERT INTO backtest_results
                (name, market, timeframe, strategy_name, strategy_display_name,
                 start_date, end_date, initial_capital, buy_fraction, config_json, status,
                 total_return, annual_return, max_drawdown, sharpe_ratio, win_rate,
                 total_trades, winning_trades, losing_trades, avg_profit, avg_loss,
                 final_capital, peak_capital, equity_curve_json, error_message,
                 execution_time_ms, completed_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                       ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)
            "#,
        )
        .bind(&record.name)
        .bind(&record.market)
        .bind(&record.timeframe)
        .bind(&record.strategy_name)
        .bind(&record.strategy_display_name)
        .bind(record.start_date)
        .bind(record.end_date)
        .bind(&record.initial_capital)
        .bind(&record.buy_fraction)
        .bind(&record.config_json)
        .bind(&record.status)
        .bind(record.total_return)
        .bind(record.annual_return)
        .bind(record.max_drawdown)
        .bind(record.sharpe_ratio)
        .bind(record.win_rate)
        .bind(record.total_trades)
        .bind(record.winning_trades)
        .bind(record.losing_trades)
        .bind(record.avg_profit)
        .bind(record.avg_loss)
        .bind(record.final_capital)
        .bind(record.peak_capital)
        .bind(&record.equity_curve_json)
        .bind(&record.error_message)
        .bind(record.execution_time_ms)
        .bind(record.completed_at)
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();

        for t in trades {
            sqlx::query(
                r#"INSERT INTO backtest_trades
                    (backtest_id, timestamp, side, price, volume, total_amount, commission,
                     reason, balance_before, balance_after, portfolio_value, profit_pct)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            )
            .bind(id)
            .bind(t.timestamp)
            .bind(&t.side)
            .bind(t.price)
            .bind(t.volume)
            .bind(t.total_amount)
            .bind(t.commission)
            .bind(&t.reason)
            .bind(t.balance_before)
            .bind(t.balance_after)
            .bind(t.portfolio_value)
            .bind(t.profit_pct)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> DbResult<Option<BacktestRecord>> {
        let record =
            sqlx::query_as::<_, BacktestRecord>("SELECT * FROM backtest_results WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.pool)
                .await?;

        Ok(record)
    }

    /// Trades of run `id` in execution order
    pub async fn trades(&self, id: i64) -> DbResult<Vec<BacktestTradeRecord>> {
        let records = sqlx::query_as::<_, BacktestTradeRecord>(
            "SELECT * FROM backtest_trades WHERE backtest_id = ?1 ORDER BY timestamp ASC, id ASC",
        )
        .bind(id)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Most recent runs first
    pub async fn list_recent(&self, limit: i64) -> DbResult<Vec<BacktestSummary>> {
        let records = sqlx::query_as::<_, BacktestSummary>(
            r#"SELECT id, name, market, timeframe, strategy_name, status, total_return, created_at
               FROM backtest_results
               ORDER BY id DESC
               LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Delete a run; its trades cascade. Returns true if it existed.
    pub async fn delete(&self, id: i64) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM backtest_results WHERE id = ?1")
            .bind(id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
