//! Upbit Bot — backtesting and live signal scanning for Upbit KRW markets
//!
//! Usage:
//!   upbit-bot serve --port 3001                          — Launch the JSON API server
//!   upbit-bot backtest --market KRW-BTC --strategy RSI   — Run one backtest from CLI
//!   upbit-bot scan --strategy V4 --timeframe 5m          — Scan all KRW markets once
//!   upbit-bot sync --market KRW-BTC --timeframe 1h ...   — Download historical candles
//!   upbit-bot markets                                    — List KRW markets

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use engine::{
    BacktestConfig, BacktestEngine, BacktestStatus, DataSync, EmaTrendState, EngineError,
    ExchangeClient, RateLimiter, ScanStrategies, ScanStrategyCode, ScannerConfig, SignalScanner,
    SqliteStore, StrategyCatalog, SyncRequest, SyncState, Timeframe, UpbitClient,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "upbit-bot")]
#[command(about = "Backtesting and live signal scanning for Upbit KRW markets", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the API server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
    /// Run a backtest on stored candles
    Backtest {
        #[arg(long, default_value = "KRW-BTC")]
        market: String,
        /// Candle timeframe (1m, 5m, 15m, 1h, 4h, 1d, ...)
        #[arg(long, default_value = "1d")]
        timeframe: String,
        /// First day (YYYY-MM-DD); defaults to one year before --end
        #[arg(long)]
        start: Option<NaiveDate>,
        /// Last day (YYYY-MM-DD); defaults to today
        #[arg(long)]
        end: Option<NaiveDate>,
        /// BUY_AND_HOLD, MA_CROSS, RSI or BOLLINGER_BANDS
        #[arg(long, default_value = "BUY_AND_HOLD")]
        strategy: String,
        /// Strategy parameters as a JSON object
        #[arg(long)]
        params: Option<String>,
        /// Initial capital in KRW
        #[arg(long, default_value = "1000000")]
        capital: Decimal,
        /// Store the result in the database
        #[arg(long)]
        save: bool,
    },
    /// Scan all KRW markets once with a live-scan strategy
    Scan {
        /// V1 (Donchian), V2 (Pullback), V3 (Reversal) or V4 (EMA trend)
        #[arg(long, default_value = "V4")]
        strategy: String,
        /// Fast timeframe (default 5m)
        #[arg(long)]
        timeframe: Option<String>,
    },
    /// Download historical candles into the database
    Sync {
        #[arg(long)]
        market: String,
        #[arg(long, default_value = "1d")]
        timeframe: String,
        /// First day (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,
        /// Last day (YYYY-MM-DD); defaults to today
        #[arg(long)]
        end: Option<NaiveDate>,
    },
    /// List tradable KRW markets
    Markets,
}

#[derive(Clone)]
struct AppState {
    store: Arc<SqliteStore>,
    backtests: Arc<BacktestEngine>,
    scanner: Arc<SignalScanner>,
    sync: DataSync,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,upbit_bot=debug,sqlx=warn")
    } else {
        EnvFilter::new("info,engine=info,upbit_bot=info,sqlx=warn")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

fn db_path() -> String {
    std::env::var("UPBIT_BOT_DB_PATH").unwrap_or_else(|_| "data/upbit-bot.db".to_string())
}

async fn open_store() -> anyhow::Result<(String, SqliteStore)> {
    let path = db_path();
    let db = persistence::Database::new(&path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!("Database initialized: {}", path);
    Ok((path, SqliteStore::new(db.pool_clone())))
}

fn upbit_client() -> anyhow::Result<Arc<UpbitClient>> {
    let base_url = std::env::var("UPBIT_API_BASE_URL")
        .unwrap_or_else(|_| engine::api::upbit::DEFAULT_BASE_URL.to_string());
    Ok(Arc::new(UpbitClient::new(base_url)?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Serve { host, port } => {
            cmd_serve(&host, port).await?;
        }
        Commands::Backtest {
            market,
            timeframe,
            start,
            end,
            strategy,
            params,
            capital,
            save,
        } => {
            let end = end.unwrap_or_else(|| Local::now().date_naive());
            let start = start.unwrap_or(end - chrono::Duration::days(365));
            let strategy_params = match params {
                Some(json) => serde_json::from_str(&json)?,
                None => serde_json::Map::new(),
            };
            let config = BacktestConfig {
                name: format!("{} {} {}", market, timeframe, strategy),
                market,
                timeframe: timeframe.parse()?,
                start_date: start,
                end_date: end,
                initial_capital: capital,
                strategy_name: strategy,
                strategy_params,
                ..Default::default()
            };
            cmd_backtest(config, save).await?;
        }
        Commands::Scan {
            strategy,
            timeframe,
        } => {
            let code: ScanStrategyCode = strategy.parse()?;
            let timeframe = timeframe.map(|tf| tf.parse::<Timeframe>()).transpose()?;
            cmd_scan(code, timeframe).await?;
        }
        Commands::Sync {
            market,
            timeframe,
            start,
            end,
        } => {
            let request = SyncRequest {
                market,
                timeframe: timeframe.parse()?,
                start_date: start,
                end_date: end.unwrap_or_else(|| Local::now().date_naive()),
            };
            cmd_sync(request).await?;
        }
        Commands::Markets => {
            cmd_markets().await?;
        }
    }

    Ok(())
}

// ============================================================================
// Serve command — Axum API server
// ============================================================================

async fn cmd_serve(host: &str, port: u16) -> anyhow::Result<()> {
    info!("Upbit Bot v{} starting...", APP_VERSION);

    let (path, store) = open_store().await?;
    let store = Arc::new(store);
    let client = upbit_client()?;

    let state = AppState {
        store: store.clone(),
        backtests: Arc::new(BacktestEngine::new(store.clone())),
        scanner: Arc::new(SignalScanner::new(
            client.clone(),
            ScanStrategies::default(),
            RateLimiter::default(),
            ScannerConfig::default(),
        )),
        sync: DataSync::new(client, store, RateLimiter::default()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/strategies", get(api_strategies))
        .route("/backtest", post(api_run_backtest).get(api_list_backtests))
        .route(
            "/backtest/:id",
            get(api_get_backtest).delete(api_delete_backtest),
        )
        .route("/scan/signals", get(api_scan_signals))
        .route("/scan/status", get(api_scan_status))
        .route("/scan/cancel", post(api_scan_cancel))
        .route("/ema-trend/states", get(api_ema_states))
        .route("/ema-trend/state/:symbol", get(api_ema_state))
        .route("/ema-trend/reset/:symbol", post(api_ema_reset))
        .route("/ema-trend/reset-all", post(api_ema_reset_all))
        .route("/ema-trend/config", get(api_ema_config))
        .route("/data/sync", post(api_start_sync))
        .route("/data/sync/:task_id", get(api_sync_status))
        .route("/data/sync-history", get(api_sync_history))
        .route("/data/available", get(api_available_data))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Upbit Bot v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health                  - Health check");
    println!("  GET  /api/strategies              - Backtest and scan strategy catalog");
    println!("  POST /api/backtest                - Run and store a backtest");
    println!("  GET  /api/backtest                - Recent backtests");
    println!("  GET  /api/backtest/:id            - Stored backtest with trades");
    println!("  GET  /api/scan/signals            - Scan KRW markets (?strategy=V1&timeframe=5m)");
    println!("  GET  /api/scan/status             - Poll scan progress");
    println!("  POST /api/scan/cancel             - Cancel running scan");
    println!("  GET  /api/ema-trend/states        - EMA-trend state of every symbol");
    println!("  GET  /api/ema-trend/state/:symbol - EMA-trend state of one symbol");
    println!("  POST /api/ema-trend/reset/:symbol - Reset one symbol to FLAT");
    println!("  POST /api/ema-trend/reset-all     - Reset every symbol");
    println!("  GET  /api/ema-trend/config        - EMA-trend parameters and states");
    println!("  POST /api/data/sync               - Start a historical data sync");
    println!("  GET  /api/data/sync/:task_id      - Poll a data sync");
    println!("  GET  /api/data/sync-history       - Finished data syncs");
    println!("  GET  /api/data/available          - Stored candle coverage");
    println!("\n  Database: {}", path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Backtest command
// ============================================================================

async fn cmd_backtest(config: BacktestConfig, save: bool) -> anyhow::Result<()> {
    println!("\n=== Upbit Bot v{} — Backtest ===", APP_VERSION);
    let (path, store) = open_store().await?;
    let store = Arc::new(store);
    println!(
        "{} {} | {} → {} | {} | capital {}",
        config.market,
        config.timeframe,
        config.start_date,
        config.end_date,
        config.strategy_name,
        config.initial_capital
    );

    let engine = BacktestEngine::new(store.clone());
    let result = engine.run(config).await;

    match (&result.status, &result.metrics) {
        (BacktestStatus::Completed, Some(m)) => {
            println!(
                "\n  Strategy:      {}",
                result.strategy_display_name.as_deref().unwrap_or("-")
            );
            println!("  Total return:  {:>10.2}%", m.total_return);
            println!("  Annual return: {:>10.2}%", m.annual_return);
            println!("  Max drawdown:  {:>10.2}%", m.max_drawdown);
            println!("  Sharpe ratio:  {:>10.2}", m.sharpe_ratio);
            println!(
                "  Trades:        {:>10} ({} won, {} lost, {:.1}% win rate)",
                m.total_trades, m.winning_trades, m.losing_trades, m.win_rate
            );
            println!("  Final capital: {:>10.0} KRW", m.final_capital);
            println!("  Elapsed:       {:>10} ms", result.execution_time_ms);
        }
        _ => {
            println!(
                "\n  Backtest failed: {}",
                result.error_message.as_deref().unwrap_or("unknown error")
            );
        }
    }

    if save {
        let id = store.save_backtest(&result).await?;
        println!("\n  Saved as #{} in {}", id, path);
    }
    Ok(())
}

// ============================================================================
// Scan command
// ============================================================================

async fn cmd_scan(code: ScanStrategyCode, timeframe: Option<Timeframe>) -> anyhow::Result<()> {
    println!("\n=== Upbit Bot v{} — Scan {} ===", APP_VERSION, code);

    let scanner = Arc::new(SignalScanner::new(
        upbit_client()?,
        ScanStrategies::default(),
        RateLimiter::default(),
        ScannerConfig::default(),
    ));

    let scanner_for_ctrlc = scanner.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        scanner_for_ctrlc.cancel();
    });

    let results = scanner.scan(code, timeframe).await?;
    let progress = scanner.progress().snapshot();
    println!(
        "Scanned {}/{} markets ({} failed), {} signals\n",
        progress.scanned,
        progress.total,
        progress.failed,
        results.len()
    );

    for r in &results {
        println!(
            "  {:<12} {:<10} {:?} @ {:>14.2} ({:+.2}%) [{}]",
            r.market,
            r.coin_name,
            r.signal,
            r.current_price,
            r.change_rate,
            r.reason_codes.join(", ")
        );
        if let (Some(stop), Some(target)) = (r.stop_price, r.target_price) {
            println!("               stop {:.2} / target {:.2}", stop, target);
        }
    }
    Ok(())
}

// ============================================================================
// Sync / markets commands
// ============================================================================

async fn cmd_sync(request: SyncRequest) -> anyhow::Result<()> {
    println!("\n=== Upbit Bot v{} — Data Sync ===", APP_VERSION);
    let (path, store) = open_store().await?;
    let store = Arc::new(store);
    println!(
        "{} {} | {} → {} | {}",
        request.market, request.timeframe, request.start_date, request.end_date, path
    );

    let sync = DataSync::new(upbit_client()?, store.clone(), RateLimiter::default());
    let status = sync.run(request.clone()).await?;
    println!(
        "\n  {}: {}",
        status.status.as_str(),
        status.message.as_deref().unwrap_or("")
    );

    let stored = store
        .candle_count(&request.market, request.timeframe)
        .await?;
    println!("  {} {} candles stored", stored, request.timeframe);

    if status.status == SyncState::Failed {
        anyhow::bail!("sync failed");
    }
    Ok(())
}

async fn cmd_markets() -> anyhow::Result<()> {
    let markets = upbit_client()?.markets().await?;
    println!("{} KRW markets\n", markets.len());
    for m in &markets {
        println!("  {:<14} {:<16} {}", m.market, m.korean_name, m.english_name);
    }
    Ok(())
}

// ============================================================================
// API Handlers — General / Backtest
// ============================================================================

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "upbit-bot",
        "version": APP_VERSION,
    }))
}

/// GET /api/strategies — backtest and scan strategy catalog
async fn api_strategies(State(state): State<AppState>) -> Json<StrategyCatalog> {
    Json(StrategyCatalog::build(state.scanner.strategies()))
}

/// POST /api/backtest — run a backtest and store its result
async fn api_run_backtest(
    State(state): State<AppState>,
    Json(config): Json<BacktestConfig>,
) -> Json<serde_json::Value> {
    info!(
        market = %config.market,
        timeframe = %config.timeframe,
        strategy = %config.strategy_name,
        "Backtest requested via API"
    );

    let result = state.backtests.run(config).await;
    let id = match state.store.save_backtest(&result).await {
        Ok(id) => Some(id),
        Err(e) => {
            error!("Failed to save backtest: {}", e);
            None
        }
    };

    Json(serde_json::json!({
        "success": result.status == BacktestStatus::Completed,
        "id": id,
        "result": result,
    }))
}

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

/// GET /api/backtest — most recent stored runs
async fn api_list_backtests(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    let backtests = state.store.recent_backtests(limit).await.map_err(|e| {
        error!("Failed to list backtests: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(serde_json::json!({
        "count": backtests.len(),
        "backtests": backtests,
    })))
}

/// GET /api/backtest/:id — stored run with trades and equity curve
async fn api_get_backtest(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.store.load_backtest(id).await {
        Ok(Some(stored)) => Ok(Json(serde_json::json!(stored))),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!("Failed to load backtest {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// DELETE /api/backtest/:id
async fn api_delete_backtest(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.store.delete_backtest(id).await {
        Ok(true) => Ok(Json(serde_json::json!({ "success": true }))),
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!("Failed to delete backtest {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// ============================================================================
// API Handlers — Scanner
// ============================================================================

/// GET /api/scan/signals?strategy=V1&timeframe=5m — scan all KRW markets
async fn api_scan_signals(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let code = match params
        .get("strategy")
        .map(String::as_str)
        .unwrap_or("V1")
        .parse::<ScanStrategyCode>()
    {
        Ok(code) => code,
        Err(e) => return failure(e),
    };
    let timeframe = match params.get("timeframe").map(|tf| tf.parse::<Timeframe>()) {
        Some(Ok(tf)) => Some(tf),
        Some(Err(e)) => return failure(e),
        None => None,
    };

    info!(strategy = %code, ?timeframe, "Scan requested via API");
    match state.scanner.scan(code, timeframe).await {
        Ok(signals) => Json(serde_json::json!({
            "success": true,
            "strategy": code,
            "count": signals.len(),
            "signals": signals,
            "progress": state.scanner.progress().snapshot(),
        })),
        Err(EngineError::ScanInProgress) => {
            let pct = state.scanner.progress().progress_pct();
            failure(format!("Scan already running ({:.0}% complete)", pct))
        }
        Err(e) => {
            error!("Scan failed: {}", e);
            failure(e)
        }
    }
}

/// GET /api/scan/status — poll scan progress
async fn api_scan_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.scanner.progress().snapshot()))
}

/// POST /api/scan/cancel — cancel running scan
async fn api_scan_cancel(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.scanner.cancel();
    info!("Scan cancel requested via API");
    Json(serde_json::json!({
        "success": true,
        "message": "Cancel requested"
    }))
}

// ============================================================================
// API Handlers — EMA trend state machine
// ============================================================================

fn state_info(state: EmaTrendState) -> serde_json::Value {
    serde_json::json!({
        "state": state,
        "display_name": state.display_name(),
        "description": state.description(),
    })
}

/// GET /api/ema-trend/states — state of every tracked symbol
async fn api_ema_states(State(state): State<AppState>) -> Json<serde_json::Value> {
    let ema = &state.scanner.strategies().ema_trend;
    let sessions = ema.sessions().snapshot();

    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    for session in sessions.values() {
        *counts.entry(session.state.as_str()).or_default() += 1;
    }

    Json(serde_json::json!({
        "count": sessions.len(),
        "by_state": counts,
        "states": sessions,
    }))
}

/// GET /api/ema-trend/state/:symbol
async fn api_ema_state(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Json<serde_json::Value> {
    let ema = &state.scanner.strategies().ema_trend;
    let current = ema.state(&symbol);
    let mut body = state_info(current);
    body["symbol"] = serde_json::json!(symbol);
    body["session"] = serde_json::json!(ema.session(&symbol));
    Json(body)
}

/// POST /api/ema-trend/reset/:symbol — back to FLAT
async fn api_ema_reset(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Json<serde_json::Value> {
    let existed = state.scanner.strategies().ema_trend.reset(&symbol);
    info!(symbol = %symbol, existed, "EMA-trend state reset via API");
    Json(serde_json::json!({
        "success": true,
        "symbol": symbol,
        "existed": existed,
        "state": EmaTrendState::Flat,
    }))
}

/// POST /api/ema-trend/reset-all
async fn api_ema_reset_all(State(state): State<AppState>) -> Json<serde_json::Value> {
    let ema = &state.scanner.strategies().ema_trend;
    let cleared = ema.sessions().len();
    ema.reset_all();
    warn!(cleared, "All EMA-trend states reset via API");
    Json(serde_json::json!({
        "success": true,
        "cleared": cleared,
    }))
}

/// GET /api/ema-trend/config — parameters plus the state table
async fn api_ema_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    let ema = &state.scanner.strategies().ema_trend;
    let states: Vec<serde_json::Value> = EmaTrendState::ALL
        .iter()
        .map(|&s| {
            let mut info = state_info(s);
            info["next"] = serde_json::json!(s.successors());
            info
        })
        .collect();

    Json(serde_json::json!({
        "config": ema.config(),
        "states": states,
    }))
}

// ============================================================================
// API Handlers — Historical data
// ============================================================================

/// POST /api/data/sync — start a background sync
async fn api_start_sync(
    State(state): State<AppState>,
    Json(request): Json<SyncRequest>,
) -> Json<serde_json::Value> {
    match state.sync.spawn(request) {
        Ok(task_id) => Json(serde_json::json!({
            "success": true,
            "task_id": task_id,
            "status": SyncState::InProgress,
        })),
        Err(e) => failure(e),
    }
}

/// GET /api/data/sync/:task_id — poll a sync
async fn api_sync_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    state
        .sync
        .status(&task_id)
        .map(|status| Json(serde_json::json!(status)))
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /api/data/sync-history — finished syncs, newest first
async fn api_sync_history(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let history = state.store.sync_history(limit).await.map_err(|e| {
        error!("Failed to load sync history: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(serde_json::json!({
        "count": history.len(),
        "history": history,
        "running": state
            .sync
            .tasks()
            .list()
            .into_iter()
            .filter(|s| s.status == SyncState::InProgress)
            .collect::<Vec<_>>(),
    })))
}

/// GET /api/data/available — stored candle coverage
async fn api_available_data(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let available = state.store.available_market_data().await.map_err(|e| {
        error!("Failed to list stored data: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(serde_json::json!({
        "count": available.len(),
        "markets": available,
    })))
}

fn failure(e: impl std::fmt::Display) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": false,
        "message": e.to_string(),
    }))
}
