//! Idempotent three-layer upsert.
//!
//! For one `(partition_key, period)` batch, inside one transaction:
//! 1. raw rows are inserted only when their content hash is new
//! 2. records are transformed to facts and merged by content hash
//! 3. the slice's aggregate rows are recomputed from its current facts and
//!    each category row is replaced
//!
//! Any failure rolls the whole batch back. Replaying a batch is a no-op
//! apart from refreshing mutable fact fields and aggregate counts. Category
//! rows that no longer occur in the slice are left in place.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use ingest_core::{aggregate_slice, to_facts, Period, RawRecord, Result};
use telemetry::metrics;

use crate::layers::{LayerStore, LayerTransaction, RawRow, StoreError};

/// Per-layer effect of one upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub raw_inserted: u64,
    pub facts_inserted: u64,
    pub facts_updated: u64,
    pub aggregate_rows: u64,
}

#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn LayerStore>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn LayerStore>) -> Self {
        Self { store }
    }

    /// Write `records` into all three layers and return the number of newly
    /// inserted facts.
    pub async fn upsert(
        &self,
        partition_key: &str,
        period: Period,
        records: &[RawRecord],
    ) -> Result<u64> {
        Ok(self.upsert_detailed(partition_key, period, records).await?.facts_inserted)
    }

    pub async fn upsert_detailed(
        &self,
        partition_key: &str,
        period: Period,
        records: &[RawRecord],
    ) -> Result<UpsertSummary> {
        let mut tx = self.store.begin().await?;

        let result = match apply(tx.as_mut(), partition_key, period, records).await {
            Ok(summary) => tx.commit().await.map(|()| summary),
            Err(e) => Err(e),
        };

        match result {
            Ok(summary) => {
                metrics().store_commits.inc();
                info!(
                    force = partition_key,
                    month = %period,
                    records = records.len(),
                    raw_inserted = summary.raw_inserted,
                    facts_inserted = summary.facts_inserted,
                    facts_updated = summary.facts_updated,
                    aggregate_rows = summary.aggregate_rows,
                    "Upsert committed"
                );
                Ok(summary)
            }
            Err(e) => {
                tx.rollback().await;
                metrics().store_rollbacks.inc();
                warn!(force = partition_key, month = %period, error = %e, "Upsert rolled back");
                Err(e.into())
            }
        }
    }
}

async fn apply(
    tx: &mut dyn LayerTransaction,
    partition_key: &str,
    period: Period,
    records: &[RawRecord],
) -> std::result::Result<UpsertSummary, StoreError> {
    let raw_rows: Vec<RawRow> = records
        .iter()
        .map(|r| RawRow::new(partition_key, period, r.clone()))
        .collect();
    let raw_inserted = tx.insert_raw_if_absent(&raw_rows).await?;

    let facts = to_facts(partition_key, period, records);
    let merged = tx.merge_facts(&facts).await?;

    let categories = tx.slice_categories(partition_key, period).await?;
    let aggregates = aggregate_slice(
        partition_key,
        period,
        categories.iter().map(|c| Some(c.as_str())),
    );
    tx.upsert_aggregates(&aggregates).await?;

    Ok(UpsertSummary {
        raw_inserted,
        facts_inserted: merged.inserted,
        facts_updated: merged.updated,
        aggregate_rows: aggregates.len() as u64,
    })
}
