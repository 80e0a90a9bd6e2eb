//! Database schema definitions

/// SQL to create all tables
/// NOTE: money inputs of a backtest config are stored as TEXT to preserve
/// rust_decimal::Decimal precision; simulation outputs are REAL.
pub const CREATE_TABLES: &str = r#"
-- Historical candles, one row per (market, timeframe, timestamp)
CREATE TABLE IF NOT EXISTS market_candles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    acc_trade_value REAL NOT NULL DEFAULT 0,
    created_at INTEGER DEFAULT (strftime('%s', 'now')),
    UNIQUE (market, timeframe, timestamp)
);

-- Backtest runs
CREATE TABLE IF NOT EXISTS backtest_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    market TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    strategy_name TEXT NOT NULL,
    strategy_display_name TEXT,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    initial_capital TEXT NOT NULL,
    buy_fraction TEXT NOT NULL DEFAULT '0.99',
    config_json TEXT NOT NULL,
    status TEXT NOT NULL,
    total_return REAL,
    annual_return REAL,
    max_drawdown REAL,
    sharpe_ratio REAL,
    win_rate REAL,
    total_trades INTEGER,
    winning_trades INTEGER,
    losing_trades INTEGER,
    avg_profit REAL,
    avg_loss REAL,
    final_capital REAL,
    peak_capital REAL,
    equity_curve_json TEXT NOT NULL DEFAULT '[]',
    error_message TEXT,
    execution_time_ms INTEGER NOT NULL DEFAULT 0,
    completed_at TEXT,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Simulated fills of a backtest run
CREATE TABLE IF NOT EXISTS backtest_trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    backtest_id INTEGER NOT NULL REFERENCES backtest_results(id) ON DELETE CASCADE,
    timestamp TEXT NOT NULL,
    side TEXT NOT NULL,
    price REAL NOT NULL,
    volume REAL NOT NULL,
    total_amount REAL NOT NULL,
    commission REAL NOT NULL,
    reason TEXT NOT NULL,
    balance_before REAL NOT NULL,
    balance_after REAL NOT NULL,
    portfolio_value REAL NOT NULL,
    profit_pct REAL
);

-- Finished historical data syncs
CREATE TABLE IF NOT EXISTS data_sync_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    market TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    status TEXT NOT NULL,
    records_saved INTEGER NOT NULL DEFAULT 0,
    message TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_candles_lookup ON market_candles(market, timeframe, timestamp);
CREATE INDEX IF NOT EXISTS idx_backtest_created ON backtest_results(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_trades_backtest ON backtest_trades(backtest_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_sync_history_market ON data_sync_history(market, timeframe)
"#;

/// Individual statements of [`CREATE_TABLES`] with comment lines removed
pub fn statements() -> Vec<String> {
    CREATE_TABLES
        .split(';')
        .map(|statement| {
            statement
                .lines()
                .filter(|line| !line.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string()
        })
        .filter(|sql| !sql.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_skip_comments_and_blanks() {
        let all = statements();
        assert_eq!(all.len(), 8);
        assert!(all.iter().all(|s| !s.contains("--")));
        assert!(all[0].starts_with("CREATE TABLE IF NOT EXISTS market_candles"));
        assert!(all[1].contains("buy_fraction TEXT NOT NULL DEFAULT '0.99'"));
    }
}
