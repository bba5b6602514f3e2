//! Unified error types for the ingestion worker.
//!
//! Every failure a job can hit falls into one of these classes:
//! - TRANSPORT: broker/network hiccups, retried locally with bounded attempts
//! - UPSTREAM: terminal HTTP failure after backoff, or a non-retryable status
//! - STORE: any layer write failure (the whole upsert is rolled back)
//! - MALFORMED_JOB: job message without the required fields
//! - SINK: a notification sink failed (logged and swallowed, never escalated)

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error class labels, used in logs, metrics and dead-letter messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientTransport,
    Upstream,
    Store,
    MalformedJob,
    Sink,
    Serialization,
    Config,
    Internal,
}

impl ErrorKind {
    /// Get the label string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientTransport => "transient_transport",
            Self::Upstream => "upstream",
            Self::Store => "store",
            Self::MalformedJob => "malformed_job",
            Self::Sink => "sink",
            Self::Serialization => "serialization",
            Self::Config => "config",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the ingestion worker.
#[derive(Debug, Error)]
pub enum Error {
    /// Broker or network failure that survived the local retry budget.
    #[error("transport error: {0}")]
    TransientTransport(String),

    /// Upstream HTTP failure. `status` is `None` for network exceptions.
    #[error("upstream error{}: {message}", status_suffix(.status))]
    Upstream {
        status: Option<u16>,
        message: String,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("malformed job: {0}")]
    MalformedJob(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl Error {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransientTransport(msg.into())
    }

    /// Create an upstream error carrying the final HTTP status, if any.
    pub fn upstream(status: Option<u16>, msg: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: msg.into(),
        }
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn malformed_job(msg: impl Into<String>) -> Self {
        Self::MalformedJob(msg.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Get the error class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientTransport(_) => ErrorKind::TransientTransport,
            Self::Upstream { .. } => ErrorKind::Upstream,
            Self::Store(_) => ErrorKind::Store,
            Self::MalformedJob(_) => ErrorKind::MalformedJob,
            Self::Sink(_) => ErrorKind::Sink,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Config(_) => ErrorKind::Config,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether running the same job again could succeed.
    ///
    /// Malformed jobs and payloads never will. Upstream 4xx responses other
    /// than 429 are client errors and will not either.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientTransport(_) | Self::Store(_) | Self::Internal(_) => true,
            Self::Upstream { status, .. } => match status {
                Some(429) => true,
                Some(s) => !(400..500).contains(s),
                None => true,
            },
            Self::MalformedJob(_) | Self::Serialization(_) | Self::Config(_) | Self::Sink(_) => {
                false
            }
        }
    }
}
