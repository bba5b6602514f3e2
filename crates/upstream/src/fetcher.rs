//! Rate-limited HTTP GET with retries.

use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use ingest_core::{Error, Result};
use telemetry::metrics;

use crate::backoff::{next_step, AttemptOutcome, BackoffPolicy, NextStep};
use crate::config::UpstreamConfig;
use crate::limiter::TokenBucketLimiter;

/// GET client that takes one limiter token per attempt and retries network
/// failures and retryable statuses with jittered backoff.
///
/// Non-retryable error statuses fail on the first attempt.
pub struct BackoffFetcher {
    http: reqwest::Client,
    limiter: Arc<TokenBucketLimiter>,
    policy: BackoffPolicy,
    retryable_statuses: Vec<u16>,
}

impl BackoffFetcher {
    pub fn new(config: &UpstreamConfig, limiter: Arc<TokenBucketLimiter>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            limiter,
            policy: config.backoff_policy()?,
            retryable_statuses: config.retryable_statuses.clone(),
        })
    }

    /// Build the fetcher together with its own limiter.
    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        let limiter = TokenBucketLimiter::new(config.rate_per_sec, config.burst)?;
        Self::new(config, Arc::new(limiter))
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn limiter(&self) -> &Arc<TokenBucketLimiter> {
        &self.limiter
    }

    /// GET `url` with `params`, returning the first successful response.
    ///
    /// Fails with [`Error::Upstream`] carrying the last status seen (or
    /// `None` after a network error) once retries are exhausted.
    pub async fn fetch(&self, url: &str, params: &[(&str, &str)]) -> Result<reqwest::Response> {
        let mut attempt = 0u32;

        loop {
            self.limiter.acquire(1).await;

            let started = Instant::now();
            let result = self.http.get(url).query(params).send().await;
            let latency_ms = started.elapsed().as_millis() as u64;
            metrics().api_latency_ms.observe(latency_ms);

            let (outcome, status, response) = match result {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    metrics().api_calls.inc(status.to_string());
                    let outcome = AttemptOutcome::from_status(status, &self.retryable_statuses);
                    (outcome, Some(status), Some(resp))
                }
                Err(e) => {
                    metrics().api_calls.inc("exception");
                    (AttemptOutcome::transport(e), None, None)
                }
            };

            info!(
                target: "upstream::attempt",
                url,
                attempt,
                status = ?status,
                latency_ms,
                outcome = outcome.label(),
                "Upstream call"
            );

            match next_step(&self.policy, attempt, &outcome, |a| self.policy.delay(a)) {
                NextStep::Return => {
                    return response
                        .ok_or_else(|| Error::internal("successful attempt without a response"));
                }
                NextStep::GiveUp(reason) => {
                    warn!(url, attempt, status = ?status, %reason, "Upstream call failed");
                    return Err(Error::upstream(status, format!("GET {url}: {reason}")));
                }
                NextStep::RetryAfter(delay) => {
                    metrics().api_retries.inc();
                    debug!(url, attempt, delay_ms = %delay.as_millis(), "Retrying upstream call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// [`fetch`](Self::fetch) and decode the body as JSON.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<T> {
        let response = self.fetch(url, params).await?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::upstream(Some(status), format!("failed to read body: {e}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Policy with millisecond delays, for tests that exercise retries.
pub fn fast_policy(max_retries: u32) -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(1),
        cap: Duration::from_millis(5),
        max_retries,
    }
}
