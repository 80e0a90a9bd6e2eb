//! Historical candle sync
//!
//! Pulls candles for a (market, timeframe, date range) from the exchange,
//! walking backwards from the end of the range in pages of
//! [`MAX_CANDLES_PER_REQUEST`], and hands every page to a [`CandleSink`].
//! Progress of each sync is tracked by task id in [`SyncTasks`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::api::{ExchangeClient, MAX_CANDLES_PER_REQUEST};
use crate::error::{EngineError, EngineResult};
use crate::rate_limit::RateLimiter;
use crate::types::{Candle, Timeframe};

/// What to sync. Dates are inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub market: String,
    pub timeframe: Timeframe,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl SyncRequest {
    pub fn validate(&self) -> EngineResult<()> {
        if self.end_date < self.start_date {
            return Err(EngineError::InvalidRange {
                start: self.start_date.to_string(),
                end: self.end_date.to_string(),
            });
        }
        Ok(())
    }

    fn range(&self) -> (NaiveDateTime, NaiveDateTime) {
        let start = self.start_date.and_hms_opt(0, 0, 0).unwrap_or_default();
        let end = self.end_date.and_hms_opt(23, 59, 59).unwrap_or_default();
        (start, end)
    }

    fn estimated_total(&self) -> u64 {
        let days = (self.end_date - self.start_date).num_days() + 1;
        self.timeframe.estimate_count(days).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    InProgress,
    Completed,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// Status of one sync task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub task_id: String,
    pub market: String,
    pub timeframe: Timeframe,
    pub status: SyncState,
    /// 0..=100
    pub progress: f64,
    /// Candles inside the range received from the exchange
    pub records_processed: u64,
    /// Candles that were not stored before
    pub records_saved: u64,
    pub estimated_total: u64,
    pub message: Option<String>,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
}

impl SyncStatus {
    fn started(task_id: &str, request: &SyncRequest) -> Self {
        Self {
            task_id: task_id.to_string(),
            market: request.market.clone(),
            timeframe: request.timeframe,
            status: SyncState::InProgress,
            progress: 0.0,
            records_processed: 0,
            records_saved: 0,
            estimated_total: request.estimated_total(),
            message: None,
            started_at: Local::now().naive_local(),
            finished_at: None,
        }
    }
}

/// Where synced candles go
#[async_trait]
pub trait CandleSink: Send + Sync {
    /// Store candles, skipping ones already present. Returns how many were new.
    async fn save_candles(&self, candles: &[Candle]) -> EngineResult<usize>;

    /// Record a finished sync
    async fn record_sync(&self, request: &SyncRequest, status: &SyncStatus) -> EngineResult<()>;
}

/// Finished tasks kept for polling; older ones only live in sync history
pub const DEFAULT_FINISHED_RETENTION: usize = 100;

#[derive(Default)]
struct TaskTable {
    statuses: HashMap<String, SyncStatus>,
    /// Finished task ids, oldest first
    finished: VecDeque<String>,
}

/// Task id → status. Concurrent readers; each task is written only by its own sync.
#[derive(Clone)]
pub struct SyncTasks {
    inner: Arc<RwLock<TaskTable>>,
    seq: Arc<AtomicU64>,
    retain_finished: usize,
}

impl SyncTasks {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_FINISHED_RETENTION)
    }

    pub fn with_retention(retain_finished: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TaskTable::default())),
            seq: Arc::new(AtomicU64::new(0)),
            retain_finished,
        }
    }

    pub fn next_task_id(&self, market: &str, timeframe: Timeframe) -> String {
        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!(
            "sync-{}-{}-{}-{}",
            Local::now().format("%Y%m%d%H%M%S"),
            market,
            timeframe,
            n
        )
    }

    pub fn get(&self, task_id: &str) -> Option<SyncStatus> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .statuses
            .get(task_id)
            .cloned()
    }

    /// All tasks, newest first
    pub fn list(&self) -> Vec<SyncStatus> {
        let mut all: Vec<SyncStatus> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .statuses
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all
    }

    fn put(&self, status: SyncStatus) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .statuses
            .insert(status.task_id.clone(), status);
    }

    fn update(&self, task_id: &str, f: impl FnOnce(&mut SyncStatus)) {
        if let Some(status) = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .statuses
            .get_mut(task_id)
        {
            f(status);
        }
    }

    /// Mark `task_id` as finished and drop the oldest finished tasks beyond
    /// the retention limit. In-progress tasks are never dropped.
    fn retire(&self, task_id: &str) {
        let mut table = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        table.finished.push_back(task_id.to_string());
        while table.finished.len() > self.retain_finished {
            let Some(oldest) = table.finished.pop_front() else {
                break;
            };
            table.statuses.remove(&oldest);
            debug!(task_id = %oldest, "Evicted finished sync task");
        }
    }
}

impl Default for SyncTasks {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one sync to completion and return its final status. Failures never
/// propagate: they end up as a FAILED status.
pub async fn sync_market_data(
    client: &dyn ExchangeClient,
    limiter: &RateLimiter,
    sink: &dyn CandleSink,
    tasks: &SyncTasks,
    task_id: &str,
    request: &SyncRequest,
) -> SyncStatus {
    tasks.put(SyncStatus::started(task_id, request));
    info!(
        task_id,
        market = %request.market,
        timeframe = %request.timeframe,
        start = %request.start_date,
        end = %request.end_date,
        "Starting data sync"
    );

    let outcome = fetch_pages(client, limiter, sink, tasks, task_id, request).await;
    let finished_at = Local::now().naive_local();
    tasks.update(task_id, |s| {
        s.finished_at = Some(finished_at);
        match &outcome {
            Ok(()) => {
                s.status = SyncState::Completed;
                s.progress = 100.0;
                s.message = Some(format!(
                    "Synced {} candles ({} new)",
                    s.records_processed, s.records_saved
                ));
            }
            Err(e) => {
                s.status = SyncState::Failed;
                s.message = Some(e.to_string());
            }
        }
    });

    let status = match tasks.get(task_id) {
        Some(status) => status,
        None => SyncStatus::started(task_id, request),
    };
    match &outcome {
        Ok(()) => info!(
            task_id,
            processed = status.records_processed,
            saved = status.records_saved,
            "Data sync completed"
        ),
        Err(e) => error!(task_id, error = %e, "Data sync failed"),
    }

    if let Err(e) = sink.record_sync(request, &status).await {
        warn!(task_id, error = %e, "Failed to record sync history");
    }
    tasks.retire(task_id);
    status
}

async fn fetch_pages(
    client: &dyn ExchangeClient,
    limiter: &RateLimiter,
    sink: &dyn CandleSink,
    tasks: &SyncTasks,
    task_id: &str,
    request: &SyncRequest,
) -> EngineResult<()> {
    request.validate()?;
    let (start, end) = request.range();
    let mut to = end;

    loop {
        limiter.acquire().await;
        let page = client
            .candles(
                &request.market,
                request.timeframe,
                Some(to),
                MAX_CANDLES_PER_REQUEST,
            )
            .await
            .map_err(|e| EngineError::Exchange(e.to_string()))?;

        let Some(oldest) = page.first().map(|c| c.timestamp) else {
            break;
        };
        let full_page = page.len() >= MAX_CANDLES_PER_REQUEST as usize;
        let in_range: Vec<Candle> = page.into_iter().filter(|c| c.timestamp >= start).collect();

        let saved = sink.save_candles(&in_range).await?;
        tasks.update(task_id, |s| {
            s.records_processed += in_range.len() as u64;
            s.records_saved += saved as u64;
            s.progress = (s.records_processed as f64 / s.estimated_total as f64 * 100.0).min(99.0);
        });
        debug!(
            task_id,
            received = in_range.len(),
            saved,
            oldest = %oldest,
            "Sync page stored"
        );

        if !full_page || oldest <= start || oldest >= to {
            break;
        }
        to = oldest;
    }

    Ok(())
}

/// Sync service: owns the client, the sink and the task table, and runs
/// syncs either inline or as background tasks.
#[derive(Clone)]
pub struct DataSync {
    client: Arc<dyn ExchangeClient>,
    sink: Arc<dyn CandleSink>,
    limiter: Arc<RateLimiter>,
    tasks: SyncTasks,
}

impl DataSync {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        sink: Arc<dyn CandleSink>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            client,
            sink,
            limiter: Arc::new(limiter),
            tasks: SyncTasks::new(),
        }
    }

    pub fn tasks(&self) -> &SyncTasks {
        &self.tasks
    }

    pub fn status(&self, task_id: &str) -> Option<SyncStatus> {
        self.tasks.get(task_id)
    }

    /// Sync and wait for the result
    pub async fn run(&self, request: SyncRequest) -> EngineResult<SyncStatus> {
        request.validate()?;
        let task_id = self.tasks.next_task_id(&request.market, request.timeframe);
        Ok(sync_market_data(
            self.client.as_ref(),
            &self.limiter,
            self.sink.as_ref(),
            &self.tasks,
            &task_id,
            &request,
        )
        .await)
    }

    /// Start a sync in the background. Returns its task id, already
    /// registered as IN_PROGRESS.
    pub fn spawn(&self, request: SyncRequest) -> EngineResult<String> {
        request.validate()?;
        let task_id = self.tasks.next_task_id(&request.market, request.timeframe);
        self.tasks.put(SyncStatus::started(&task_id, &request));

        let this = self.clone();
        let id = task_id.clone();
        tokio::spawn(async move {
            sync_market_data(
                this.client.as_ref(),
                &this.limiter,
                this.sink.as_ref(),
                &this.tasks,
                &id,
                &request,
            )
            .await;
        });
        Ok(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::tests::RecordingPacer;
    use crate::scanner::tests::FakeExchange;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MemorySink {
        candles: Mutex<BTreeMap<(String, NaiveDateTime), Candle>>,
        history: Mutex<Vec<SyncStatus>>,
    }

    #[async_trait]
    impl CandleSink for MemorySink {
        async fn save_candles(&self, candles: &[Candle]) -> EngineResult<usize> {
            let mut stored = self.candles.lock().unwrap();
            let mut added = 0;
            for c in candles {
                let key = (c.market.clone(), c.timestamp);
                if !stored.contains_key(&key) {
                    stored.insert(key, c.clone());
                    added += 1;
                }
            }
            Ok(added)
        }

        async fn record_sync(&self, _request: &SyncRequest, status: &SyncStatus) -> EngineResult<()> {
            self.history.lock().unwrap().push(status.clone());
            Ok(())
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn request(market: &str, timeframe: Timeframe, start: NaiveDate, end: NaiveDate) -> SyncRequest {
        SyncRequest {
            market: market.to_string(),
            timeframe,
            start_date: start,
            end_date: end,
        }
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(10, Duration::from_secs(1), Arc::new(RecordingPacer::default()))
    }

    #[tokio::test]
    async fn test_sync_pages_backwards_until_exhausted() {
        let closes: Vec<f64> = (0..450).map(|i| 100.0 + i as f64).collect();
        let exchange = FakeExchange::default().with_market("KRW-BTC", &closes);
        let sink = MemorySink::default();
        let tasks = SyncTasks::new();

        let status = sync_market_data(
            &exchange,
            &limiter(),
            &sink,
            &tasks,
            "t1",
            &request("KRW-BTC", Timeframe::M1, day(1), day(1)),
        )
        .await;

        assert_eq!(status.status, SyncState::Completed);
        assert_eq!(status.records_processed, 450);
        assert_eq!(status.records_saved, 450);
        assert_eq!(status.estimated_total, 1440);
        assert_eq!(status.progress, 100.0);
        assert!(status.finished_at.is_some());
        // 200 + 200 + 50
        assert_eq!(exchange.call_count(), 3);
        assert_eq!(sink.candles.lock().unwrap().len(), 450);
        assert_eq!(tasks.get("t1").unwrap().status, SyncState::Completed);
        assert_eq!(sink.history.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resync_saves_nothing_new() {
        let closes: Vec<f64> = (0..250).map(|i| 100.0 + i as f64).collect();
        let exchange = FakeExchange::default().with_market("KRW-BTC", &closes);
        let sink = MemorySink::default();
        let tasks = SyncTasks::new();
        let req = request("KRW-BTC", Timeframe::M1, day(1), day(1));

        sync_market_data(&exchange, &limiter(), &sink, &tasks, "a", &req).await;
        let again = sync_market_data(&exchange, &limiter(), &sink, &tasks, "b", &req).await;

        assert_eq!(again.status, SyncState::Completed);
        assert_eq!(again.records_processed, 250);
        assert_eq!(again.records_saved, 0);
        assert_eq!(again.message.as_deref(), Some("Synced 250 candles (0 new)"));
    }

    #[tokio::test]
    async fn test_candles_before_start_are_dropped() {
        let mut exchange = FakeExchange::default().with_market("KRW-ETH", &[1.0; 12]);
        // Daily candles from 2023-12-25 to 2024-01-05
        let first = NaiveDate::from_ymd_opt(2023, 12, 25).unwrap();
        for (i, c) in exchange.candles.get_mut("KRW-ETH").unwrap().iter_mut().enumerate() {
            c.timestamp = (first + chrono::Duration::days(i as i64))
                .and_hms_opt(9, 0, 0)
                .unwrap();
        }
        let sink = MemorySink::default();

        let status = sync_market_data(
            &exchange,
            &limiter(),
            &sink,
            &SyncTasks::new(),
            "d",
            &request("KRW-ETH", Timeframe::D1, day(1), day(5)),
        )
        .await;

        assert_eq!(status.status, SyncState::Completed);
        assert_eq!(status.records_processed, 5);
        let stored = sink.candles.lock().unwrap();
        assert!(stored.values().all(|c| c.timestamp.date() >= day(1)));
        assert!(stored.values().all(|c| c.timeframe == Timeframe::D1));
    }

    #[tokio::test]
    async fn test_exchange_failure_marks_task_failed() {
        let mut exchange = FakeExchange::default().with_market("KRW-XRP", &[1.0, 2.0]);
        exchange.failing.push("KRW-XRP".to_string());
        let sink = MemorySink::default();
        let tasks = SyncTasks::new();

        let status = sync_market_data(
            &exchange,
            &limiter(),
            &sink,
            &tasks,
            "f",
            &request("KRW-XRP", Timeframe::M1, day(1), day(1)),
        )
        .await;

        assert_eq!(status.status, SyncState::Failed);
        assert_eq!(status.message.as_deref(), Some("Exchange error: boom"));
        assert_eq!(tasks.get("f").unwrap().status, SyncState::Failed);
        assert_eq!(sink.history.lock().unwrap()[0].status, SyncState::Failed);
    }

    #[tokio::test]
    async fn test_reversed_range_is_rejected() {
        let service = DataSync::new(
            Arc::new(FakeExchange::default()),
            Arc::new(MemorySink::default()),
            limiter(),
        );
        let err = service
            .run(request("KRW-BTC", Timeframe::D1, day(5), day(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRange { .. }));
        assert!(service.tasks().list().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_sync_is_registered_immediately() {
        let exchange = FakeExchange::default().with_market("KRW-BTC", &[1.0, 2.0, 3.0]);
        let service = DataSync::new(Arc::new(exchange), Arc::new(MemorySink::default()), limiter());

        let task_id = service
            .spawn(request("KRW-BTC", Timeframe::M1, day(1), day(1)))
            .unwrap();
        assert!(task_id.contains("KRW-BTC-1m"));
        assert!(service.status(&task_id).is_some());

        for _ in 0..100 {
            if service.status(&task_id).unwrap().status != SyncState::InProgress {
                break;
            }
            tokio::task::yield_now().await;
        }
        let status = service.status(&task_id).unwrap();
        assert_eq!(status.status, SyncState::Completed);
        assert_eq!(status.records_processed, 3);
    }

    #[tokio::test]
    async fn test_finished_tasks_beyond_retention_are_evicted() {
        let exchange = FakeExchange::default().with_market("KRW-BTC", &[1.0, 2.0, 3.0]);
        let sink = MemorySink::default();
        let tasks = SyncTasks::with_retention(2);
        let req = request("KRW-BTC", Timeframe::M1, day(1), day(1));

        // A task still running is never evicted
        tasks.put(SyncStatus::started("running", &req));
        for id in ["a", "b", "c"] {
            sync_market_data(&exchange, &limiter(), &sink, &tasks, id, &req).await;
        }

        assert!(tasks.get("a").is_none());
        assert_eq!(tasks.get("b").unwrap().status, SyncState::Completed);
        assert_eq!(tasks.get("c").unwrap().status, SyncState::Completed);
        assert_eq!(tasks.get("running").unwrap().status, SyncState::InProgress);
        assert_eq!(tasks.list().len(), 3);
        // Evicted tasks are still in the history
        assert_eq!(sink.history.lock().unwrap().len(), 3);
    }
}
