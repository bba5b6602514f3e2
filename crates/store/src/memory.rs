//! In-memory layer store.
//!
//! Transactions are serialized by an async gate and work on a staged copy
//! of the committed layers; commit swaps the copy in, so an aborted job
//! leaves nothing behind.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

use ingest_core::{AggregateRow, FactRow, Period};

use crate::layers::{Layer, LayerStore, LayerTransaction, MergeCounts, RawRow, StoreError};

type AggregateKey = (String, Period, String);

#[derive(Debug, Clone, Default)]
struct Layers {
    raw: BTreeMap<String, RawRow>,
    facts: BTreeMap<String, FactRow>,
    aggregates: BTreeMap<AggregateKey, AggregateRow>,
}

#[derive(Default)]
pub struct MemoryStore {
    committed: Arc<Mutex<Layers>>,
    gate: Arc<tokio::sync::Mutex<()>>,
    fail_on: Arc<Mutex<Option<Layer>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following transaction fail at `layer`.
    pub fn fail_on(&self, layer: Layer) {
        *self.fail_on.lock() = Some(layer);
    }

    pub fn clear_failure(&self) {
        *self.fail_on.lock() = None;
    }

    pub fn raw_count(&self) -> usize {
        self.committed.lock().raw.len()
    }

    pub fn raw_rows(&self, partition_key: &str, period: Period) -> Vec<RawRow> {
        self.committed
            .lock()
            .raw
            .values()
            .filter(|r| r.partition_key == partition_key && r.period == period)
            .cloned()
            .collect()
    }

    pub fn fact_count(&self) -> usize {
        self.committed.lock().facts.len()
    }

    pub fn facts(&self, partition_key: &str, period: Period) -> Vec<FactRow> {
        self.committed
            .lock()
            .facts
            .values()
            .filter(|f| f.partition_key == partition_key && f.period == period)
            .cloned()
            .collect()
    }

    /// Aggregate counts for one slice, keyed by category.
    pub fn aggregates(&self, partition_key: &str, period: Period) -> BTreeMap<String, u64> {
        self.committed
            .lock()
            .aggregates
            .values()
            .filter(|a| a.partition_key == partition_key && a.period == period)
            .map(|a| (a.category.clone(), a.count))
            .collect()
    }

    pub fn aggregate_count(&self) -> usize {
        self.committed.lock().aggregates.len()
    }
}

#[async_trait]
impl LayerStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn LayerTransaction>, StoreError> {
        let guard = self.gate.clone().lock_owned().await;
        let staged = self.committed.lock().clone();

        Ok(Box::new(MemoryTransaction {
            staged,
            committed: self.committed.clone(),
            fail_on: *self.fail_on.lock(),
            finished: false,
            _guard: guard,
        }))
    }
}

struct MemoryTransaction {
    staged: Layers,
    committed: Arc<Mutex<Layers>>,
    fail_on: Option<Layer>,
    finished: bool,
    _guard: OwnedMutexGuard<()>,
}

impl MemoryTransaction {
    fn check(&self, layer: Layer) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::Finished);
        }
        if self.fail_on == Some(layer) {
            return Err(StoreError::Injected(layer));
        }
        Ok(())
    }
}

#[async_trait]
impl LayerTransaction for MemoryTransaction {
    async fn insert_raw_if_absent(&mut self, rows: &[RawRow]) -> Result<u64, StoreError> {
        self.check(Layer::Raw)?;
        let mut inserted = 0;
        for row in rows {
            let key = row.content_hash.as_str().to_string();
            if !self.staged.raw.contains_key(&key) {
                self.staged.raw.insert(key, row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn merge_facts(&mut self, rows: &[FactRow]) -> Result<MergeCounts, StoreError> {
        self.check(Layer::Fact)?;
        let mut counts = MergeCounts::default();
        for row in rows {
            match self.staged.facts.get_mut(row.content_hash.as_str()) {
                Some(existing) => {
                    if existing.apply_mutable(row) {
                        counts.updated += 1;
                    }
                }
                None => {
                    self.staged
                        .facts
                        .insert(row.content_hash.as_str().to_string(), row.clone());
                    counts.inserted += 1;
                }
            }
        }
        Ok(counts)
    }

    async fn slice_categories(
        &mut self,
        partition_key: &str,
        period: Period,
    ) -> Result<Vec<String>, StoreError> {
        self.check(Layer::Aggregate)?;
        Ok(self
            .staged
            .facts
            .values()
            .filter(|f| f.partition_key == partition_key && f.period == period)
            .map(|f| f.outcome.clone())
            .collect())
    }

    async fn upsert_aggregates(&mut self, rows: &[AggregateRow]) -> Result<(), StoreError> {
        self.check(Layer::Aggregate)?;
        for row in rows {
            let key = (row.partition_key.clone(), row.period, row.category.clone());
            self.staged.aggregates.insert(key, row.clone());
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.check(Layer::Commit)?;
        self.finished = true;
        *self.committed.lock() = std::mem::take(&mut self.staged);
        Ok(())
    }

    async fn rollback(&mut self) {
        self.finished = true;
        self.staged = Layers::default();
    }
}
