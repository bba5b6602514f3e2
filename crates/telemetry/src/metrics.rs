//! In-process metrics.
//!
//! Atomic counters and a latency histogram, read back as a serializable
//! snapshot. Each upstream attempt, broker disposition and job outcome is
//! recorded here as a side channel; callers never depend on the values.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters keyed by a small label set (HTTP status, "exception").
#[derive(Debug, Default)]
pub struct LabeledCounter(Mutex<BTreeMap<String, u64>>);

impl LabeledCounter {
    pub fn inc(&self, label: impl Into<String>) {
        *self.0.lock().entry(label.into()).or_default() += 1;
    }

    pub fn get(&self, label: &str) -> u64 {
        self.0.lock().get(label).copied().unwrap_or(0)
    }

    pub fn values(&self) -> BTreeMap<String, u64> {
        self.0.lock().clone()
    }
}

/// Latency histogram in milliseconds.
#[derive(Debug)]
pub struct Histogram {
    buckets: [AtomicU64; 9],
    sum: AtomicU64,
    count: AtomicU64,
    max: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: Default::default(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }
}

impl Histogram {
    /// Upper bounds; the last bucket also takes everything above it.
    const BOUNDS_MS: [u64; 9] = [10, 50, 100, 250, 500, 1_000, 5_000, 10_000, 30_000];

    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.max.fetch_max(ms, Ordering::Relaxed);

        let idx = Self::BOUNDS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(Self::BOUNDS_MS.len() - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum.load(Ordering::Relaxed) as f64 / n as f64,
        }
    }

    pub fn buckets(&self) -> Vec<(u64, u64)> {
        Self::BOUNDS_MS
            .iter()
            .zip(self.buckets.iter())
            .map(|(&bound, n)| (bound, n.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Collected metrics for the ingestion worker.
#[derive(Debug, Default)]
pub struct Metrics {
    // Jobs
    pub jobs_ok: Counter,
    pub jobs_failed: Counter,
    pub rows_fetched: Counter,
    pub rows_inserted: Counter,

    // Upstream
    pub api_calls: LabeledCounter,
    pub api_retries: Counter,
    pub api_latency_ms: Histogram,
    pub limiter_waits: Counter,

    // Broker
    pub messages_received: Counter,
    pub messages_acked: Counter,
    pub messages_nacked: Counter,
    pub messages_dead_lettered: Counter,
    pub reconnects: Counter,

    // Store
    pub store_commits: Counter,
    pub store_rollbacks: Counter,

    // Notifications
    pub sink_failures: Counter,
    pub completion_publish_failures: Counter,
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub jobs_ok: u64,
    pub jobs_failed: u64,
    pub rows_fetched: u64,
    pub rows_inserted: u64,
    pub api_calls: BTreeMap<String, u64>,
    pub api_retries: u64,
    pub api_latency_mean_ms: f64,
    pub api_latency_max_ms: u64,
    pub messages_received: u64,
    pub messages_acked: u64,
    pub messages_nacked: u64,
    pub messages_dead_lettered: u64,
    pub reconnects: u64,
    pub store_commits: u64,
    pub store_rollbacks: u64,
    pub sink_failures: u64,
    pub completion_publish_failures: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            jobs_ok: self.jobs_ok.get(),
            jobs_failed: self.jobs_failed.get(),
            rows_fetched: self.rows_fetched.get(),
            rows_inserted: self.rows_inserted.get(),
            api_calls: self.api_calls.values(),
            api_retries: self.api_retries.get(),
            api_latency_mean_ms: self.api_latency_ms.mean(),
            api_latency_max_ms: self.api_latency_ms.max(),
            messages_received: self.messages_received.get(),
            messages_acked: self.messages_acked.get(),
            messages_nacked: self.messages_nacked.get(),
            messages_dead_lettered: self.messages_dead_lettered.get(),
            reconnects: self.reconnects.get(),
            store_commits: self.store_commits.get(),
            store_rollbacks: self.store_rollbacks.get(),
            sink_failures: self.sink_failures.get(),
            completion_publish_failures: self.completion_publish_failures.get(),
        }
    }
}

/// Global metrics registry.
pub static METRICS: std::sync::LazyLock<Metrics> = std::sync::LazyLock::new(Metrics::new);

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    &METRICS
}
