//! Exponential backoff with jitter and attempt classification.

use rand::Rng;
use std::time::Duration;

/// Retry timing for upstream calls.
///
/// The delay before retry `k` (0-based) is `min(cap, base * 2^k)` scaled
/// by a uniform jitter factor in `[0.5, 1.5)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(8),
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    pub const JITTER_MIN: f64 = 0.5;
    pub const JITTER_MAX: f64 = 1.5;

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Un-jittered delay for retry `attempt`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Jittered delay for retry `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = rand::thread_rng().gen_range(Self::JITTER_MIN..Self::JITTER_MAX);
        self.delay_with_jitter(attempt, factor)
    }

    pub fn delay_with_jitter(&self, attempt: u32, factor: f64) -> Duration {
        let factor = factor.clamp(Self::JITTER_MIN, Self::JITTER_MAX);
        self.ceiling(attempt).mul_f64(factor)
    }
}

/// Result of one HTTP attempt, before deciding what to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 2xx/3xx response
    Success,
    /// Status in the retryable set, or a transport failure
    Retryable(String),
    /// Any other error status
    Terminal(String),
}

impl AttemptOutcome {
    /// Classify a response status.
    pub fn from_status(status: u16, retryable: &[u16]) -> Self {
        if retryable.contains(&status) {
            Self::Retryable(format!("status {status}"))
        } else if status >= 400 {
            Self::Terminal(format!("status {status}"))
        } else {
            Self::Success
        }
    }

    /// Timeouts and connection errors always retry.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Retryable(err.to_string())
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retryable(_) => "retryable",
            Self::Terminal(_) => "terminal",
        }
    }
}

/// What the fetch loop does after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    Return,
    RetryAfter(Duration),
    GiveUp(String),
}

/// Pure transition from an attempt result to the next step.
///
/// `attempt` is 0-based. `delay` is only consulted when another attempt
/// is allowed.
pub fn next_step(
    policy: &BackoffPolicy,
    attempt: u32,
    outcome: &AttemptOutcome,
    delay: impl FnOnce(u32) -> Duration,
) -> NextStep {
    match outcome {
        AttemptOutcome::Success => NextStep::Return,
        AttemptOutcome::Terminal(reason) => NextStep::GiveUp(reason.clone()),
        AttemptOutcome::Retryable(reason) => {
            if attempt + 1 >= policy.max_attempts() {
                NextStep::GiveUp(format!(
                    "gave up after {} attempts: {reason}",
                    policy.max_attempts()
                ))
            } else {
                NextStep::RetryAfter(delay(attempt))
            }
        }
    }
}
