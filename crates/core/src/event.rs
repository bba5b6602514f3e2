//! Job completion events fanned out to notification sinks.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::job::Job;

/// Outcome of one job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Ok,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produced once per job attempt. Not persisted.
///
/// `partition_key` and `period` are optional because a malformed job may
/// not carry them; whatever the message had is passed through verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "force")]
    pub partition_key: Option<String>,
    #[serde(rename = "month")]
    pub period: Option<String>,
    #[serde(rename = "rows")]
    pub rows_fetched: u64,
    #[serde(rename = "inserted")]
    pub rows_inserted: u64,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobEvent {
    pub fn ok(job: &Job, rows_fetched: u64, rows_inserted: u64) -> Self {
        Self {
            partition_key: Some(job.partition_key.clone()),
            period: Some(job.period.to_string()),
            rows_fetched,
            rows_inserted,
            status: JobStatus::Ok,
            message: None,
        }
    }

    pub fn error(
        partition_key: Option<String>,
        period: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            partition_key,
            period,
            rows_fetched: 0,
            rows_inserted: 0,
            status: JobStatus::Error,
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == JobStatus::Ok
    }

    /// `force month` label for log lines and email subjects.
    pub fn label(&self) -> String {
        format!(
            "{} {}",
            self.partition_key.as_deref().unwrap_or("?"),
            self.period.as_deref().unwrap_or("?")
        )
    }
}
