//! Live multi-market signal scanner
//!
//! For every KRW market: fetch the latest fast and slow candle windows, run
//! the chosen scan strategy and keep the non-NONE results. Exchange calls go
//! through the shared [`RateLimiter`]; a failing market is logged and
//! skipped, and a cancel request stops further calls while keeping what was
//! already collected.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::{ExchangeClient, MarketInfo, MAX_CANDLES_PER_REQUEST};
use crate::error::{EngineError, EngineResult};
use crate::rate_limit::RateLimiter;
use crate::strategy::{ScanStrategies, ScanStrategy, ScanStrategyCode};
use crate::types::{SignalType, Timeframe};

// ============================================================================
// Config & results
// ============================================================================

/// | field            | default |
/// |------------------|---------|
/// | fast_timeframe   | 5m      |
/// | slow_timeframe   | 15m     |
/// | window           | 200     |
/// | reference_offset | 100     |
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub fast_timeframe: Timeframe,
    pub slow_timeframe: Timeframe,
    /// Candles fetched per timeframe and market
    pub window: u32,
    /// Change rate is measured against the close this many bars back
    pub reference_offset: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            fast_timeframe: Timeframe::M5,
            slow_timeframe: Timeframe::M15,
            window: MAX_CANDLES_PER_REQUEST,
            reference_offset: 100,
        }
    }
}

/// One market with a BUY or SELL signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalScanResult {
    pub market: String,
    pub coin_name: String,
    pub current_price: f64,
    /// Percent change vs. the reference close
    pub change_rate: f64,
    pub signal: SignalType,
    pub reason_codes: Vec<String>,
    pub indicators: BTreeMap<String, serde_json::Value>,
    pub candle_time: Option<NaiveDateTime>,
    pub entry_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub scan_time: NaiveDateTime,
}

// ============================================================================
// Progress
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Idle,
    Running,
    Complete,
    Cancelled,
    Error,
}

/// Shared progress of the running (or last) scan
pub struct ScanProgress {
    pub status: RwLock<ScanStatus>,
    pub strategy: RwLock<Option<ScanStrategyCode>>,
    pub current_market: RwLock<String>,
    pub total: AtomicU32,
    pub scanned: AtomicU32,
    pub signals: AtomicU32,
    pub failed: AtomicU32,
    pub cancelled: AtomicBool,
    pub error_message: RwLock<Option<String>>,
    pub started_at: RwLock<Option<NaiveDateTime>>,
}

/// Serializable view of [`ScanProgress`]
#[derive(Debug, Clone, Serialize)]
pub struct ScanProgressSnapshot {
    pub status: ScanStatus,
    pub strategy: Option<ScanStrategyCode>,
    pub current_market: String,
    pub total: u32,
    pub scanned: u32,
    pub signals: u32,
    pub failed: u32,
    pub progress_pct: f32,
    pub error_message: Option<String>,
    pub started_at: Option<NaiveDateTime>,
}

impl ScanProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(ScanStatus::Idle),
            strategy: RwLock::new(None),
            current_market: RwLock::new(String::new()),
            total: AtomicU32::new(0),
            scanned: AtomicU32::new(0),
            signals: AtomicU32::new(0),
            failed: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            error_message: RwLock::new(None),
            started_at: RwLock::new(None),
        }
    }

    pub fn reset(&self, code: ScanStrategyCode) {
        self.set_status(ScanStatus::Running);
        *self.strategy.write().unwrap_or_else(PoisonError::into_inner) = Some(code);
        self.set_market("");
        self.total.store(0, Ordering::Relaxed);
        self.scanned.store(0, Ordering::Relaxed);
        self.signals.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
        *self.error_message.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self.started_at.write().unwrap_or_else(PoisonError::into_inner) =
            Some(Local::now().naive_local());
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> ScanStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ScanStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn set_market(&self, market: &str) {
        *self.current_market.write().unwrap_or_else(PoisonError::into_inner) = market.to_string();
    }

    fn fail(&self, message: String) {
        self.set_status(ScanStatus::Error);
        *self.error_message.write().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    pub fn progress_pct(&self) -> f32 {
        let total = self.total.load(Ordering::Relaxed);
        let done = self.scanned.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }

    pub fn snapshot(&self) -> ScanProgressSnapshot {
        ScanProgressSnapshot {
            status: self.status(),
            strategy: *self.strategy.read().unwrap_or_else(PoisonError::into_inner),
            current_market: self
                .current_market
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            total: self.total.load(Ordering::Relaxed),
            scanned: self.scanned.load(Ordering::Relaxed),
            signals: self.signals.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            progress_pct: self.progress_pct(),
            error_message: self
                .error_message
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            started_at: *self.started_at.read().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

impl Default for ScanProgress {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Scanning
// ============================================================================

/// Percent change of `current` vs. the close `offset` bars back, 0 when the
/// window is too short.
fn change_rate(closes: &[f64], offset: usize) -> f64 {
    let Some(&current) = closes.last() else {
        return 0.0;
    };
    if offset == 0 || closes.len() <= offset {
        return 0.0;
    }
    let reference = closes[closes.len() - offset];
    if reference > 0.0 {
        (current - reference) / reference * 100.0
    } else {
        0.0
    }
}

/// Wait for the limiter, then bail out if the scan was cancelled meanwhile.
async fn pace(limiter: &RateLimiter, progress: &ScanProgress) -> EngineResult<()> {
    limiter.acquire().await;
    if progress.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    Ok(())
}

async fn scan_single_market(
    client: &dyn ExchangeClient,
    strategy: &dyn ScanStrategy,
    config: &ScannerConfig,
    limiter: &RateLimiter,
    progress: &ScanProgress,
    market: &MarketInfo,
) -> EngineResult<Option<SignalScanResult>> {
    pace(limiter, progress).await?;
    let fast = client
        .candles(&market.market, config.fast_timeframe, None, config.window)
        .await
        .map_err(|e| EngineError::Exchange(e.to_string()))?;
    pace(limiter, progress).await?;
    let slow = client
        .candles(&market.market, config.slow_timeframe, None, config.window)
        .await
        .map_err(|e| EngineError::Exchange(e.to_string()))?;

    if fast.len() < strategy.warmup_bars() {
        debug!(market = %market.market, bars = fast.len(), "Not enough candles, skipping");
        return Ok(None);
    }

    let signal = strategy.evaluate(&market.market, &fast, &slow);
    if signal.is_none() {
        return Ok(None);
    }

    let closes: Vec<f64> = fast.iter().map(|c| c.close).collect();
    let current_price = closes.last().copied().unwrap_or_default();

    Ok(Some(SignalScanResult {
        market: market.market.clone(),
        coin_name: market.korean_name.clone(),
        current_price,
        change_rate: change_rate(&closes, config.reference_offset),
        signal: signal.signal_type,
        reason_codes: signal.reason_codes,
        indicators: signal.indicators,
        candle_time: signal.candle_time,
        entry_price: signal.entry_price,
        stop_price: signal.stop_price,
        target_price: signal.target_price,
        scan_time: Local::now().naive_local(),
    }))
}

/// Scan every KRW market with `strategy`.
///
/// Fails only when the market list cannot be fetched. On cancel the signals
/// collected so far are returned.
pub async fn scan_markets(
    client: &dyn ExchangeClient,
    strategy: &dyn ScanStrategy,
    config: &ScannerConfig,
    limiter: &RateLimiter,
    progress: &ScanProgress,
) -> EngineResult<Vec<SignalScanResult>> {
    progress.reset(strategy.code());
    info!(
        strategy = %strategy.code(),
        fast = %config.fast_timeframe,
        slow = %config.slow_timeframe,
        "Starting market scan"
    );

    if pace(limiter, progress).await.is_err() {
        info!("Scan cancelled before the market list was fetched");
        progress.set_status(ScanStatus::Cancelled);
        return Ok(Vec::new());
    }
    let markets = match client.markets().await {
        Ok(m) => m,
        Err(e) => {
            progress.fail(e.to_string());
            return Err(EngineError::Exchange(e.to_string()));
        }
    };
    progress.total.store(markets.len() as u32, Ordering::Relaxed);
    info!(markets = markets.len(), "Scanning KRW markets");

    let mut results = Vec::new();
    for market in &markets {
        if progress.is_cancelled() {
            info!(collected = results.len(), "Scan cancelled");
            progress.set_status(ScanStatus::Cancelled);
            return Ok(results);
        }
        progress.set_market(&market.market);

        match scan_single_market(client, strategy, config, limiter, progress, market).await {
            Err(EngineError::Cancelled) => {
                info!(collected = results.len(), market = %market.market, "Scan cancelled");
                progress.set_status(ScanStatus::Cancelled);
                return Ok(results);
            }
            Ok(Some(result)) => {
                info!(market = %result.market, signal = ?result.signal, "Signal found");
                progress.signals.fetch_add(1, Ordering::Relaxed);
                results.push(result);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(market = %market.market, error = %e, "Market scan failed");
                progress.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        progress.scanned.fetch_add(1, Ordering::Relaxed);
    }

    progress.set_status(ScanStatus::Complete);
    info!(signals = results.len(), "Scan complete");
    Ok(results)
}

/// Scanner service: exchange client, strategy set, limiter and progress
pub struct SignalScanner {
    client: Arc<dyn ExchangeClient>,
    strategies: ScanStrategies,
    limiter: RateLimiter,
    config: ScannerConfig,
    progress: Arc<ScanProgress>,
    running: AtomicBool,
}

/// Releases the scanner's run claim, also when the scan future is dropped
struct RunClaim<'a>(&'a AtomicBool);

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SignalScanner {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        strategies: ScanStrategies,
        limiter: RateLimiter,
        config: ScannerConfig,
    ) -> Self {
        Self {
            client,
            strategies,
            limiter,
            config,
            progress: Arc::new(ScanProgress::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn strategies(&self) -> &ScanStrategies {
        &self.strategies
    }

    pub fn progress(&self) -> Arc<ScanProgress> {
        Arc::clone(&self.progress)
    }

    pub fn cancel(&self) {
        self.progress.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Scan with strategy `code`; `fast_timeframe` overrides the configured
    /// fast window.
    ///
    /// Only one scan runs at a time: a call made while another scan holds
    /// the limiter and progress fails with [`EngineError::ScanInProgress`].
    pub async fn scan(
        &self,
        code: ScanStrategyCode,
        fast_timeframe: Option<Timeframe>,
    ) -> EngineResult<Vec<SignalScanResult>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(strategy = %code, "Scan rejected, another scan is running");
            return Err(EngineError::ScanInProgress);
        }
        let _claim = RunClaim(&self.running);

        let mut config = self.config.clone();
        if let Some(tf) = fast_timeframe {
            config.fast_timeframe = tf;
        }
        let strategy = self.strategies.get(code);
        self.limiter.reset();
        scan_markets(
            self.client.as_ref(),
            strategy.as_ref(),
            &config,
            &self.limiter,
            &self.progress,
        )
        .await
    }
}
