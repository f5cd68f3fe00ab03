/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 */

//! Token-bucket rate limiting shared across segment workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{DownloadError, DownloadResult};

#[derive(Debug)]
struct Bucket {
    /// May go negative: an acquire consumes immediately and sleeps off the
    /// deficit, which keeps concurrent acquisitions honest in aggregate.
    tokens: f64,
    last_refill: Instant,
}

/// A token-bucket byte throttle.
///
/// One instance is constructed per download (from its speed limit) and one
/// is shared by reference across every worker of every download (the global
/// limiter). All accounting goes through a single internal mutex; workers
/// never keep local token state. Construct and inject, never a singleton,
/// so tests get isolated instances.
#[derive(Debug)]
pub struct RateLimiter {
    /// Bytes per second; 0 disables the limiter
    rate: AtomicU64,
    /// Maximum accumulated tokens in bytes
    burst: AtomicU64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Limiter with the default burst of two seconds' worth of the rate
    pub fn new(rate_per_sec: u64) -> Self {
        Self::with_burst(rate_per_sec, rate_per_sec.saturating_mul(2))
    }

    pub fn with_burst(rate_per_sec: u64, burst: u64) -> Self {
        Self {
            rate: AtomicU64::new(rate_per_sec),
            burst: AtomicU64::new(burst.max(1)),
            bucket: Mutex::new(Bucket {
                tokens: burst.max(1) as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A limiter that never throttles
    pub fn unlimited() -> Self {
        Self::with_burst(0, 1)
    }

    /// Build a limiter from an optional limit; `None` and `Some(0)` both
    /// mean unthrottled
    pub fn from_limit(limit: Option<u64>) -> Arc<Self> {
        Arc::new(match limit {
            Some(rate) if rate > 0 => Self::new(rate),
            _ => Self::unlimited(),
        })
    }

    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Acquire)
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate() == 0
    }

    /// Swap the rate without resetting accumulated tokens. Rate 0 disables
    /// throttling; the accumulated balance survives a later re-enable.
    pub fn set_rate(&self, rate_per_sec: u64) {
        self.rate.store(rate_per_sec, Ordering::Release);
        self.burst
            .store(rate_per_sec.saturating_mul(2).max(1), Ordering::Release);
    }

    /// Consume `n` tokens, suspending for exactly the time needed to cover
    /// any deficit. Returns `DownloadError::Cancelled` (with the tokens
    /// refunded) if the token fires while waiting.
    pub async fn acquire(&self, n: u64, cancel: &CancellationToken) -> DownloadResult<()> {
        let rate = self.rate();
        if rate == 0 || n == 0 {
            return Ok(());
        }

        let wait = {
            let mut bucket = self.bucket.lock().await;
            self.refill(&mut bucket, rate);
            bucket.tokens -= n as f64;
            if bucket.tokens >= 0.0 {
                None
            } else {
                Some(Duration::from_secs_f64(-bucket.tokens / rate as f64))
            }
        };

        let Some(wait) = wait else {
            return Ok(());
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = cancel.cancelled() => {
                let mut bucket = self.bucket.lock().await;
                bucket.tokens += n as f64;
                Err(DownloadError::Cancelled)
            }
        }
    }

    fn refill(&self, bucket: &mut Bucket, rate: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.last_refill = now;
        let burst = self.burst.load(Ordering::Acquire) as f64;
        bucket.tokens = (bucket.tokens + elapsed * rate as f64).min(burst);
    }

    /// Tokens currently available (test observability)
    pub async fn available(&self) -> f64 {
        let rate = self.rate();
        let mut bucket = self.bucket.lock().await;
        if rate > 0 {
            self.refill(&mut bucket, rate);
        }
        bucket.tokens
    }
}
