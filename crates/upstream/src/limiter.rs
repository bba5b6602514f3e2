//! Token bucket limiter for outbound calls.
//!
//! Tokens refill lazily on each call by `elapsed * rate`, capped at the
//! bucket capacity. A caller that finds too few tokens sleeps for the
//! deficit (at most [`MAX_WAIT_SLICE`] at a time) and re-checks, so
//! concurrent callers interleave instead of one sleeping through a long
//! debt. Service order under contention is approximate first-come.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{trace, warn};

use ingest_core::{Error, Result};
use telemetry::metrics;

/// Longest single sleep before re-checking the bucket.
pub const MAX_WAIT_SLICE: Duration = Duration::from_secs(1);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Process-local token bucket. Each worker process owns its own quota.
pub struct TokenBucketLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucketLimiter {
    /// Creates a limiter with `rate` tokens per second.
    ///
    /// `capacity` defaults to `max(1, 2 * rate)`. The bucket starts full.
    pub fn new(rate: f64, capacity: Option<u32>) -> Result<Self> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(Error::config(format!("limiter rate must be > 0, got {rate}")));
        }

        let capacity = match capacity {
            Some(c) if c > 0 => c as f64,
            Some(_) => return Err(Error::config("limiter capacity must be > 0")),
            None => (2.0 * rate).floor().max(1.0),
        };

        Ok(Self {
            rate,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Wait until `n` tokens are available, then debit them.
    ///
    /// Requests above the capacity are clamped to it; they could never be
    /// satisfied otherwise.
    pub async fn acquire(&self, n: u32) {
        let mut wanted = n as f64;
        if wanted > self.capacity {
            warn!(requested = n, capacity = self.capacity, "Token request exceeds bucket capacity, clamping");
            wanted = self.capacity;
        }

        loop {
            let deficit = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket);
                if bucket.tokens >= wanted {
                    bucket.tokens -= wanted;
                    return;
                }
                wanted - bucket.tokens
            };

            let wait = Duration::from_secs_f64(deficit / self.rate).min(MAX_WAIT_SLICE);
            trace!(wait_ms = %wait.as_millis(), "Waiting for rate limiter tokens");
            metrics().limiter_waits.inc();
            tokio::time::sleep(wait).await;
        }
    }

    /// Take `n` tokens if they are available right now.
    pub fn try_acquire(&self, n: u32) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= n as f64 {
            bucket.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.last_refill = now;
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
    }
}
