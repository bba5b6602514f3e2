//! Police open-data API endpoints used by the worker.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use ingest_core::{Job, RawRecord, Result};

use crate::config::UpstreamConfig;
use crate::fetcher::BackoffFetcher;

/// A police force as listed by `/forces`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceSummary {
    pub id: String,
    pub name: String,
}

/// Thin client over [`BackoffFetcher`] for the stop-and-search endpoints.
#[derive(Clone)]
pub struct StopSearchClient {
    fetcher: Arc<BackoffFetcher>,
    base_url: String,
}

impl StopSearchClient {
    pub fn new(fetcher: Arc<BackoffFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        let fetcher = BackoffFetcher::from_config(config)?;
        Ok(Self::new(Arc::new(fetcher), config.base_url.clone()))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Stop-and-search records for one force and month.
    ///
    /// A body that is valid JSON but not an array yields no records.
    pub async fn stops_by_force(&self, job: &Job) -> Result<Vec<RawRecord>> {
        let url = format!("{}/stops-force", self.base_url);
        let month = job.period.to_string();
        let body: Value = self
            .fetcher
            .fetch_json(&url, &[("force", job.partition_key.as_str()), ("date", month.as_str())])
            .await?;

        match body {
            Value::Array(items) => Ok(items.into_iter().map(RawRecord::new).collect()),
            other => {
                warn!(
                    force = %job.partition_key,
                    month = %month,
                    kind = json_kind(&other),
                    "Upstream returned a non-list body, treating as empty"
                );
                Ok(Vec::new())
            }
        }
    }

    pub async fn list_forces(&self) -> Result<Vec<ForceSummary>> {
        let url = format!("{}/forces", self.base_url);
        self.fetcher.fetch_json(&url, &[]).await
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
