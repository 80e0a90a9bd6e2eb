//! Market candle repository

use crate::DbResult;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// One stored candle. `timeframe` is the short code ("5m", "1d", ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CandleRecord {
    pub market: String,
    pub timeframe: String,
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub acc_trade_value: f64,
}

/// Stored coverage of one (market, timeframe)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AvailableMarketData {
    pub market: String,
    pub timeframe: String,
    pub first_timestamp: NaiveDateTime,
    pub last_timestamp: NaiveDateTime,
    pub record_count: i64,
}

pub struct CandleRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> CandleRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert candles, ignoring ones already stored for the same
    /// (market, timeframe, timestamp). Returns the number inserted.
    pub async fn insert_many(&self, candles: &[CandleRecord]) -> DbResult<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for c in candles {
            let result = sqlx::query(
                r#"INSERT OR IGNORE INTO market_candles
                    (market, timeframe, timestamp, open, high, low, close, volume, acc_trade_value)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )
            .bind(&c.market)
            .bind(&c.timeframe)
            .bind(c.timestamp)
            .bind(c.open)
            .bind(c.high)
            .bind(c.low)
            .bind(c.close)
            .bind(c.volume)
            .bind(c.acc_trade_value)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Candles with `start <= timestamp <= end`, oldest first
    pub async fn find_range(
        &self,
        market: &str,
        timeframe: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> DbResult<Vec<CandleRecord>> {
        let records = sqlx::query_as::<_, CandleRecord>(
            r#"SELECT market, timeframe, timestamp, open, high, low, close, volume, acc_trade_value
               FROM market_candles
               WHERE market = ?1 AND timeframe = ?2 AND timestamp >= ?3 AND timestamp <= ?4
               ORDER BY timestamp ASC
            "#,
        )
        .bind(market)
        .bind(timeframe)
        .bind(start)
        .bind(end)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    pub async fn count(&self, market: &str, timeframe: &str) -> DbResult<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM market_candles WHERE market = ?1 AND timeframe = ?2")
                .bind(market)
                .bind(timeframe)
                .fetch_one(self.pool)
                .await?;

        Ok(row.0)
    }

    /// Coverage of every stored (market, timeframe)
    pub async fn available(&self) -> DbResult<Vec<AvailableMarketData>> {
        let records = sqlx::query_as::<_, AvailableMarketData>(
            r#"SELECT market, timeframe,
                      MIN(timestamp) AS first_timestamp,
                      MAX(timestamp) AS last_timestamp,
                      COUNT(*) AS record_count
               FROM market_candles
               GROUP BY market, timeframe
               ORDER BY market, timeframe
            "#,
        )
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn candle(market: &str, timestamp: NaiveDateTime, close: f64) -> CandleRecord {
        CandleRecord {
            market: market.to_string(),
            timeframe: "5m".to_string(),
            timestamp,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            acc_trade_value: close * 10.0,
        }
    }

    #[tokio::test]
    async fn test_insert_skips_duplicates() {
        let db = Database::in_memory().await.unwrap();
        let repo = CandleRepository::new(db.pool());

        let first = vec![candle("KRW-BTC", ts(9, 0), 100.0), candle("KRW-BTC", ts(9, 5), 101.0)];
        assert_eq!(repo.insert_many(&first).await.unwrap(), 2);

        let overlap = vec![candle("KRW-BTC", ts(9, 5), 999.0), candle("KRW-BTC", ts(9, 10), 102.0)];
        assert_eq!(repo.insert_many(&overlap).await.unwrap(), 1);

        assert_eq!(repo.count("KRW-BTC", "5m").await.unwrap(), 3);
        assert_eq!(repo.count("KRW-BTC", "1d").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_find_range_is_ascending_and_inclusive() {
        let db = Database::in_memory().await.unwrap();
        let repo = CandleRepository::new(db.pool());
        let rows = vec![
            candle("KRW-BTC", ts(9, 10), 102.0),
            candle("KRW-BTC", ts(9, 0), 100.0),
            candle("KRW-BTC", ts(9, 5), 101.0),
            candle("KRW-ETH", ts(9, 5), 5.0),
        ];
        repo.insert_many(&rows).await.unwrap();

        let found = repo
            .find_range("KRW-BTC", "5m", ts(9, 0), ts(9, 5))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].timestamp, ts(9, 0));
        assert_eq!(found[1].close, 101.0);
    }

    #[tokio::test]
    async fn test_available_groups_by_market_and_timeframe() {
        let db = Database::in_memory().await.unwrap();
        let repo = CandleRepository::new(db.pool());
        let rows = vec![
            candle("KRW-BTC", ts(9, 0), 100.0),
            candle("KRW-BTC", ts(10, 0), 100.0),
            candle("KRW-ETH", ts(11, 0), 5.0),
        ];
        repo.insert_many(&rows).await.unwrap();

        let available = repo.available().await.unwrap();
        assert_eq!(available.len(), 2);
        assert_eq!(available[0].market, "KRW-BTC");
        assert_eq!(available[0].first_timestamp, ts(9, 0));
        assert_eq!(available[0].last_timestamp, ts(10, 0));
        assert_eq!(available[0].record_count, 2);
    }
}
