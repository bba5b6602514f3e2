//! Upstream client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use ingest_core::{Error, Result};

use crate::backoff::BackoffPolicy;

/// Police API client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// API root, without trailing slash
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Sustained request rate (tokens per second)
    #[serde(default = "default_rate_per_sec")]
    pub rate_per_sec: f64,
    /// Burst ceiling; `None` means max(1, 2 * rate)
    #[serde(default)]
    pub burst: Option<u32>,
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff base in seconds
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: f64,
    /// Backoff ceiling in seconds (before jitter)
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: f64,
    /// Statuses retried with backoff
    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: Vec<u16>,
    /// Per-attempt timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_base_url() -> String {
    "https://data.police.uk/api".to_string()
}

fn default_rate_per_sec() -> f64 {
    2.0
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_secs() -> f64 {
    0.5
}

fn default_backoff_cap_secs() -> f64 {
    8.0
}

fn default_retryable_statuses() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_user_agent() -> String {
    concat!("stopsearch-ingest/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            rate_per_sec: default_rate_per_sec(),
            burst: None,
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
            retryable_statuses: default_retryable_statuses(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl UpstreamConfig {
    /// Fails on negative, non-finite or out-of-range durations.
    pub fn backoff_policy(&self) -> Result<BackoffPolicy> {
        Ok(BackoffPolicy {
            base: seconds("backoff_base_secs", self.backoff_base_secs)?,
            cap: seconds("backoff_cap_secs", self.backoff_cap_secs)?,
            max_retries: self.max_retries,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| Error::config(format!("{field} must be a finite, non-negative number of seconds, got {value}: {e}")))
}
