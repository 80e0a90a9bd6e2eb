//! Cooperative request pacing for the exchange client
//!
//! Upbit allows roughly 10 quotation requests per second. Instead of
//! sleeping before every call, the limiter lets a batch of requests through
//! and pauses once before the next batch starts.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

pub const DEFAULT_BATCH_SIZE: u32 = 10;
pub const DEFAULT_PAUSE: Duration = Duration::from_secs(1);

/// Something that can wait. Swapped for a recording fake in tests.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, duration: Duration);
}

/// Sleeps on the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioPacer;

#[async_trait]
impl Pacer for TokioPacer {
    async fn pause(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub struct RateLimiter {
    batch_size: u32,
    pause: Duration,
    issued: AtomicU32,
    pacer: Arc<dyn Pacer>,
}

impl RateLimiter {
    pub fn new(batch_size: u32, pause: Duration, pacer: Arc<dyn Pacer>) -> Self {
        Self {
            batch_size: batch_size.max(1),
            pause,
            issued: AtomicU32::new(0),
            pacer,
        }
    }

    /// Wait (if needed) before issuing one more request.
    pub async fn acquire(&self) {
        let n = self.issued.fetch_add(1, Ordering::Relaxed);
        if n > 0 && n % self.batch_size == 0 {
            debug!(requests = n, pause_ms = self.pause.as_millis() as u64, "Rate limit pause");
            self.pacer.pause(self.pause).await;
        }
    }

    /// Requests issued so far
    pub fn issued(&self) -> u32 {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.issued.store(0, Ordering::Relaxed);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE, DEFAULT_PAUSE, Arc::new(TokioPacer))
    }
}
