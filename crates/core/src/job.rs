//! Job contract and broker wire messages.
//!
//! A job names one slice of upstream data: a force (the partition key) and
//! a calendar month (the period). The broker payload uses the short names
//! `force` and `month`.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::event::{JobEvent, JobStatus};

/// A calendar month in `YYYY-MM` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) || !(1..=9999).contains(&year) {
            return Err(Error::malformed_job(format!(
                "invalid period {year:04}-{month:02}"
            )));
        }
        Ok(Self { year, month })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// First day of the month.
    pub fn first_day(&self) -> NaiveDate {
        // Fields are validated on construction.
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or_default()
    }

    /// The month that contains `date`.
    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| Error::malformed_job(format!("period must be YYYY-MM, got {s:?}")))?;

        if year.len() != 4 || month.len() != 2 {
            return Err(Error::malformed_job(format!(
                "period must be YYYY-MM, got {s:?}"
            )));
        }

        let year: i32 = year
            .parse()
            .map_err(|_| Error::malformed_job(format!("invalid year in {s:?}")))?;
        let month: u32 = month
            .parse()
            .map_err(|_| Error::malformed_job(format!("invalid month in {s:?}")))?;

        Self::new(year, month)
    }
}

impl Serialize for Period {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One unit of fetch work. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "force")]
    pub partition_key: String,
    #[serde(rename = "month")]
    pub period: Period,
}

impl Job {
    pub fn new(partition_key: impl Into<String>, period: Period) -> Self {
        Self {
            partition_key: partition_key.into(),
            period,
        }
    }

    /// Decode a job from a broker message body.
    ///
    /// Fails with `MalformedJob` when `force` or `month` is missing, blank,
    /// or not a string, or when `month` is not `YYYY-MM`.
    pub fn from_body(body: &Value) -> Result<Self> {
        let force = body
            .get("force")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::malformed_job(format!("missing force in {body}")))?;

        let month = body
            .get("month")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::malformed_job(format!("missing month in {body}")))?;

        Ok(Self::new(force, month.parse()?))
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.partition_key, self.period)
    }
}

/// Completion message published to the done destination after every attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub force: Option<String>,
    pub month: Option<String>,
    #[serde(default)]
    pub rows: u64,
    #[serde(default)]
    pub inserted: u64,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&JobEvent> for CompletionMessage {
    fn from(event: &JobEvent) -> Self {
        Self {
            force: event.partition_key.clone(),
            month: event.period.clone(),
            rows: event.rows_fetched,
            inserted: event.rows_inserted,
            status: event.status,
            error: event.message.clone(),
        }
    }
}

/// Message published to the dead-letter destination for a failed delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub original_body: Value,
    pub headers: BTreeMap<String, String>,
    pub error: String,
}

/// The last month that has fully elapsed relative to `today`.
pub fn last_full_month(today: NaiveDate) -> Period {
    Period::containing(today).previous()
}

/// Every `(force, month)` job from `start` through the last full month,
/// inclusive, month-major.
pub fn discover_jobs<S: AsRef<str>>(start: Period, forces: &[S], today: NaiveDate) -> Vec<Job> {
    let last = last_full_month(today);
    let mut jobs = Vec::new();
    let mut current = start;

    while current <= last {
        for force in forces {
            jobs.push(Job::new(force.as_ref(), current));
        }
        current = current.next();
    }

    jobs
}
