//! Persistence layer for the Upbit trading bot
//!
//! SQLite storage for historical candles, backtest results with their trades,
//! and the history of data syncs.

pub mod repository;
pub mod schema;

use std::path::Path;
use std::str::FromStr;

pub use sqlx::sqlite::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Shared SQLite pool with the schema applied
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database file at `path` in WAL mode
    pub async fn new(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| DbError::Connection(format!("{}: {e}", path.display())))?;

        Self::migrated(pool).await
    }

    /// Private in-memory database, mostly for tests. A single connection
    /// that never expires, so the data lives as long as the pool.
    pub async fn in_memory() -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DbError::Connection(e.to_string()))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> DbResult<Self> {
        let db = Self { pool };
        db.apply_schema().await?;
        Ok(db)
    }

    /// Create missing tables and indexes
    async fn apply_schema(&self) -> DbResult<()> {
        for sql in schema::statements() {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Migration(format!("{e}: {sql}")))?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Owned handle for services and spawned tasks
    pub fn pool_clone(&self) -> SqlitePool {
        self.pool.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_schema_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        // Second pass only hits IF NOT EXISTS
        db.apply_schema().await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        let names: Vec<_> = tables.into_iter().map(|(n,)| n).collect();
        assert_eq!(
            names,
            vec!["backtest_results", "backtest_trades", "data_sync_history", "market_candles"]
        );
    }

    #[tokio::test]
    async fn test_backtest_results_has_buy_fraction_column() {
        let db = Database::in_memory().await.unwrap();
        let columns: Vec<(i64, String, String, i64, Option<String>, i64)> =
            sqlx::query_as("PRAGMA table_info(backtest_results)")
                .fetch_all(db.pool())
                .await
                .unwrap();
        let buy_fraction = columns
            .iter()
            .find(|(_, name, ..)| name == "buy_fraction")
            .unwrap();
        assert_eq!(buy_fraction.2, "TEXT");
        assert_eq!(buy_fraction.3, 1);
        assert_eq!(buy_fraction.4.as_deref(), Some("'0.99'"));
    }

    #[tokio::test]
    async fn test_foreign_keys_are_enforced() {
        let db = Database::in_memory().await.unwrap();
        let (on,): (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(on, 1);
    }
}
