//! History of finished data syncs

use crate::DbResult;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SyncHistoryRecord {
    pub id: Option<i64>,
    pub task_id: String,
    pub market: String,
    pub timeframe: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// COMPLETED or FAILED
    pub status: String,
    pub records_saved: i64,
    pub message: Option<String>,
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
}

pub struct SyncHistoryRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SyncHistoryRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, entry: &SyncHistoryRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO data_sync_history
                (task_id, market, timeframe, start_date, end_date, status,
                 records_saved, message, started_at, finished_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&entry.task_id)
        .bind(&entry.market)
        .bind(&entry.timeframe)
        .bind(entry.start_date)
        .bind(entry.end_date)
        .bind(&entry.status)
        .bind(entry.records_saved)
        .bind(&entry.message)
        .bind(entry.started_at)
        .bind(entry.finished_at)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Latest entries first
    pub async fn recent(&self, limit: i64) -> DbResult<Vec<SyncHistoryRecord>> {
        let records = sqlx::query_as::<_, SyncHistoryRecord>(
            "SELECT * FROM data_sync_history ORDER BY finished_at DESC, id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}
