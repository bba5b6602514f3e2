//! Layer rows and the storage capability the upsert engine depends on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use ingest_core::{AggregateRow, ContentHash, FactRow, Period, RawRecord};

/// Raw-layer row: one upstream document, never overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub content_hash: ContentHash,
    pub partition_key: String,
    pub period: Period,
    pub raw_payload: RawRecord,
    pub ingested_at: DateTime<Utc>,
}

impl RawRow {
    pub fn new(partition_key: &str, period: Period, record: RawRecord) -> Self {
        Self {
            content_hash: record.content_hash(),
            partition_key: partition_key.to_string(),
            period,
            raw_payload: record,
            ingested_at: Utc::now(),
        }
    }
}

/// Result of merging a batch of facts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCounts {
    pub inserted: u64,
    pub updated: u64,
}

/// Which step of a transaction an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Raw,
    Fact,
    Aggregate,
    Commit,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Raw => "raw",
            Self::Fact => "fact",
            Self::Aggregate => "aggregate",
            Self::Commit => "commit",
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{layer} layer: {message}")]
    Backend { layer: Layer, message: String },

    #[error("injected failure in {0} layer")]
    Injected(Layer),

    #[error("transaction already finished")]
    Finished,
}

impl StoreError {
    pub fn backend(layer: Layer, message: impl fmt::Display) -> Self {
        Self::Backend {
            layer,
            message: message.to_string(),
        }
    }
}

impl From<StoreError> for ingest_core::Error {
    fn from(e: StoreError) -> Self {
        ingest_core::Error::store(e.to_string())
    }
}

/// A store that can open per-job transactions over the three layers.
#[async_trait]
pub trait LayerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LayerTransaction>, StoreError>;
}

/// One job's unit of work. Writes are visible to later calls on the same
/// transaction and to nobody else until `commit`.
#[async_trait]
pub trait LayerTransaction: Send {
    /// Insert rows whose content hash is not present yet. Returns how many
    /// were inserted.
    async fn insert_raw_if_absent(&mut self, rows: &[RawRow]) -> Result<u64, StoreError>;

    /// Insert facts with a new content hash; for known hashes update only
    /// the mutable fields.
    async fn merge_facts(&mut self, rows: &[FactRow]) -> Result<MergeCounts, StoreError>;

    /// Category (outcome) of every fact in the slice.
    async fn slice_categories(
        &mut self,
        partition_key: &str,
        period: Period,
    ) -> Result<Vec<String>, StoreError>;

    /// Insert or fully replace each `(partition_key, period, category)` row.
    async fn upsert_aggregates(&mut self, rows: &[AggregateRow]) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard staged writes. Never fails.
    async fn rollback(&mut self);
}
