//! Handler results and how the broker settles them.

use async_trait::async_trait;
use serde_json::Value;

use crate::transport::Headers;

/// Result of processing one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    /// Could succeed if processed again (upstream 5xx, store outage).
    RetryableFailure(String),
    /// Will fail again as-is (malformed job, upstream 4xx).
    TerminalFailure(String),
}

impl HandlerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::RetryableFailure(r) | Self::TerminalFailure(r) => Some(r),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryableFailure(_) => "retryable",
            Self::TerminalFailure(_) => "terminal",
        }
    }
}

/// What the queue client does with a delivery after the handler ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Publish to the dead-letter destination with this error text, then ack.
    DeadLetter(String),
    /// Let the broker redeliver.
    Nack(String),
}

/// Settle a handler outcome.
///
/// Both failure classes are dead-lettered when dead-lettering is enabled
/// and nacked otherwise; the class only shows up in the error text.
pub fn disposition(outcome: &HandlerOutcome, dlq_enabled: bool) -> Disposition {
    match outcome {
        HandlerOutcome::Success => Disposition::Ack,
        failure => {
            let error = format!("{}: {}", failure.label(), failure.reason().unwrap_or_default());
            if dlq_enabled {
                Disposition::DeadLetter(error)
            } else {
                Disposition::Nack(error)
            }
        }
    }
}

/// Processes one decoded delivery.
///
/// Invocations for a subscription never overlap.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, body: &Value, headers: &Headers) -> HandlerOutcome;
}
