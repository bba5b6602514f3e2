//! ClickHouse layer store.
//!
//! ClickHouse has no multi-statement transactions. A transaction here
//! buffers every write and flushes the three layers on `commit`, raw first.
//! Reads inside the transaction merge the committed table state (`FINAL`)
//! with the buffer. A crash mid-flush can leave an earlier layer written
//! without a later one; replaying the job converges, since raw inserts are
//! skipped by hash, facts are replaced by version and aggregates are
//! recomputed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use ingest_core::{AggregateRow, ContentHash, FactRow, Period};

use crate::client::ClickHouseClient;
use crate::layers::{Layer, LayerStore, LayerTransaction, MergeCounts, RawRow, StoreError};
use crate::schema::{AGGREGATE_TABLE, FACT_TABLE, RAW_TABLE};

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct RawStopRow {
    pub content_hash: String,
    pub force_id: String,
    pub month: String,
    pub raw_payload: String,
    /// milliseconds since epoch
    pub ingested_at: i64,
}

impl From<&RawRow> for RawStopRow {
    fn from(row: &RawRow) -> Self {
        Self {
            content_hash: row.content_hash.as_str().to_string(),
            force_id: row.partition_key.clone(),
            month: row.period.to_string(),
            raw_payload: row.raw_payload.to_json(),
            ingested_at: row.ingested_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct FactStopRow {
    pub content_hash: String,
    pub force_id: String,
    pub month: String,
    pub stop_datetime: Option<i64>,
    pub search_type: Option<String>,
    pub involved_person: Option<bool>,
    pub gender: Option<String>,
    pub age_range: Option<String>,
    pub self_defined_ethnicity: Option<String>,
    pub officer_defined_ethnicity: Option<String>,
    pub legislation: Option<String>,
    pub object_of_search: Option<String>,
    pub outcome: String,
    pub outcome_linked_to_object_of_search: Option<bool>,
    pub outcome_object_id: Option<String>,
    pub outcome_object_name: Option<String>,
    pub removal_of_more_than_outer_clothing: Option<bool>,
    pub operation: Option<bool>,
    pub operation_name: Option<String>,
    pub location_type: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub street_id: Option<i64>,
    pub street_name: Option<String>,
    pub version: u64,
}

impl FactStopRow {
    pub fn from_fact(fact: &FactRow, version: u64) -> Self {
        Self {
            content_hash: fact.content_hash.as_str().to_string(),
            force_id: fact.partition_key.clone(),
            month: fact.period.to_string(),
            stop_datetime: fact.stop_datetime.map(|d| d.timestamp_millis()),
            search_type: fact.search_type.clone(),
            involved_person: fact.involved_person,
            gender: fact.gender.clone(),
            age_range: fact.age_range.clone(),
            self_defined_ethnicity: fact.self_defined_ethnicity.clone(),
            officer_defined_ethnicity: fact.officer_defined_ethnicity.clone(),
            legislation: fact.legislation.clone(),
            object_of_search: fact.object_of_search.clone(),
            outcome: fact.outcome.clone(),
            outcome_linked_to_object_of_search: fact.outcome_linked_to_object_of_search,
            outcome_object_id: fact.outcome_object_id.clone(),
            outcome_object_name: fact.outcome_object_name.clone(),
            removal_of_more_than_outer_clothing: fact.removal_of_more_than_outer_clothing,
            operation: fact.operation,
            operation_name: fact.operation_name.clone(),
            location_type: fact.location_type.clone(),
            latitude: fact.latitude,
            longitude: fact.longitude,
            street_id: fact.street_id,
            street_name: fact.street_name.clone(),
            version,
        }
    }

    pub fn to_fact(&self) -> Result<FactRow, StoreError> {
        let period: Period = self
            .month
            .parse()
            .map_err(|e| StoreError::backend(Layer::Fact, format!("bad month in fact row: {e}")))?;

        Ok(FactRow {
            content_hash: ContentHash::from_hex(self.content_hash.clone()),
            partition_key: self.force_id.clone(),
            period,
            stop_datetime: self.stop_datetime.and_then(DateTime::<Utc>::from_timestamp_millis),
            search_type: self.search_type.clone(),
            involved_person: self.involved_person,
            gender: self.gender.clone(),
            age_range: self.age_range.clone(),
            self_defined_ethnicity: self.self_defined_ethnicity.clone(),
            officer_defined_ethnicity: self.officer_defined_ethnicity.clone(),
            legislation: self.legislation.clone(),
            object_of_search: self.object_of_search.clone(),
            outcome: self.outcome.clone(),
            outcome_linked_to_object_of_search: self.outcome_linked_to_object_of_search,
            outcome_object_id: self.outcome_object_id.clone(),
            outcome_object_name: self.outcome_object_name.clone(),
            removal_of_more_than_outer_clothing: self.removal_of_more_than_outer_clothing,
            operation: self.operation,
            operation_name: self.operation_name.clone(),
            location_type: self.location_type.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            street_id: self.street_id,
            street_name: self.street_name.clone(),
        })
    }
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct OutcomeCountRow {
    pub force_id: String,
    pub month: String,
    pub outcome: String,
    pub count: u64,
    /// milliseconds since epoch
    pub updated_at: i64,
}

#[derive(Debug, Row, Deserialize)]
struct HashOutcome {
    content_hash: String,
    outcome: String,
}

#[derive(Debug, Row, Deserialize)]
struct CategoryCount {
    outcome: String,
    count: u64,
}

/// Layer store over ClickHouse tables.
#[derive(Clone)]
pub struct ClickHouseStore {
    client: ClickHouseClient,
}

impl ClickHouseStore {
    pub fn new(client: ClickHouseClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ClickHouseClient {
        &self.client
    }

    pub async fn raw_count(&self, partition_key: &str, period: Period) -> Result<u64, StoreError> {
        self.client
            .inner()
            .query(&format!("SELECT count() FROM {RAW_TABLE} FINAL WHERE force_id = ? AND month = ?"))
            .bind(partition_key)
            .bind(period.to_string())
            .fetch_one::<u64>()
            .await
            .map_err(|e| StoreError::backend(Layer::Raw, e))
    }

    pub async fn fact_count(&self, partition_key: &str, period: Period) -> Result<u64, StoreError> {
        self.client
            .inner()
            .query(&format!("SELECT count() FROM {FACT_TABLE} FINAL WHERE force_id = ? AND month = ?"))
            .bind(partition_key)
            .bind(period.to_string())
            .fetch_one::<u64>()
            .await
            .map_err(|e| StoreError::backend(Layer::Fact, e))
    }

    /// Aggregate counts for one slice, keyed by category.
    pub async fn aggregates(
        &self,
        partition_key: &str,
        period: Period,
    ) -> Result<BTreeMap<String, u64>, StoreError> {
        let rows = self
            .client
            .inner()
            .query(&format!(
                "SELECT outcome, count FROM {AGGREGATE_TABLE} FINAL WHERE force_id = ? AND month = ?"
            ))
            .bind(partition_key)
            .bind(period.to_string())
            .fetch_all::<CategoryCount>()
            .await
            .map_err(|e| StoreError::backend(Layer::Aggregate, e))?;

        Ok(rows.into_iter().map(|r| (r.outcome, r.count)).collect())
    }
}

#[async_trait]
impl LayerStore for ClickHouseStore {
    async fn begin(&self) -> Result<Box<dyn LayerTransaction>, StoreError> {
        Ok(Box::new(ClickHouseTransaction {
            client: self.client.inner().clone(),
            raw: BTreeMap::new(),
            facts: BTreeMap::new(),
            aggregates: BTreeMap::new(),
            finished: false,
        }))
    }
}

struct ClickHouseTransaction {
    client: Client,
    raw: BTreeMap<String, RawStopRow>,
    facts: BTreeMap<String, FactStopRow>,
    aggregates: BTreeMap<(String, String, String), OutcomeCountRow>,
    finished: bool,
}

impl ClickHouseTransaction {
    fn check(&self) -> Result<(), StoreError> {
        if self.finished {
            Err(StoreError::Finished)
        } else {
            Ok(())
        }
    }
}

async fn insert_rows<'a, T, I>(client: &Client, table: &str, rows: I, layer: Layer) -> Result<usize, StoreError>
where
    T: Row + Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut insert = client
        .insert::<T>(table)
        .map_err(|e| StoreError::backend(layer, format!("insert error: {e}")))?;

    let mut count = 0;
    for row in rows {
        insert
            .write(row)
            .await
            .map_err(|e| StoreError::backend(layer, format!("write error: {e}")))?;
        count += 1;
    }

    insert
        .end()
        .await
        .map_err(|e| StoreError::backend(layer, format!("end error: {e}")))?;
    Ok(count)
}

#[async_trait]
impl LayerTransaction for ClickHouseTransaction {
    async fn insert_raw_if_absent(&mut self, rows: &[RawRow]) -> Result<u64, StoreError> {
        self.check()?;

        let candidates: BTreeSet<String> = rows
            .iter()
            .map(|r| r.content_hash.as_str().to_string())
            .filter(|h| !self.raw.contains_key(h))
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }

        let hashes: Vec<&String> = candidates.iter().collect();
        let existing: BTreeSet<String> = self
            .client
            .query(&format!("SELECT content_hash FROM {RAW_TABLE} WHERE has(?, content_hash)"))
            .bind(&hashes)
            .fetch_all::<String>()
            .await
            .map_err(|e| StoreError::backend(Layer::Raw, e))?
            .into_iter()
            .collect();

        let mut inserted = 0;
        for row in rows {
            let hash = row.content_hash.as_str();
            if existing.contains(hash) || self.raw.contains_key(hash) {
                continue;
            }
            self.raw.insert(hash.to_string(), RawStopRow::from(row));
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn merge_facts(&mut self, rows: &[FactRow]) -> Result<MergeCounts, StoreError> {
        self.check()?;

        let unseen: BTreeSet<&str> = rows
            .iter()
            .map(|f| f.content_hash.as_str())
            .filter(|h| !self.facts.contains_key(*h))
            .collect();

        let mut committed: BTreeMap<String, FactStopRow> = BTreeMap::new();
        if !unseen.is_empty() {
            let hashes: Vec<&str> = unseen.into_iter().collect();
            committed = self
                .client
                .query(&format!("SELECT ?fields FROM {FACT_TABLE} FINAL WHERE has(?, content_hash)"))
                .bind(&hashes)
                .fetch_all::<FactStopRow>()
                .await
                .map_err(|e| StoreError::backend(Layer::Fact, e))?
                .into_iter()
                .map(|r| (r.content_hash.clone(), r))
                .collect();
        }

        let mut counts = MergeCounts::default();
        for row in rows {
            let hash = row.content_hash.as_str();
            let current = match self.facts.get(hash) {
                Some(buffered) => Some((buffered.to_fact()?, buffered.version)),
                None => match committed.get(hash) {
                    Some(stored) => Some((stored.to_fact()?, stored.version + 1)),
                    None => None,
                },
            };

            match current {
                Some((mut existing, version)) => {
                    if existing.apply_mutable(row) {
                        self.facts
                            .insert(hash.to_string(), FactStopRow::from_fact(&existing, version));
                        counts.updated += 1;
                    }
                }
                None => {
                    self.facts.insert(hash.to_string(), FactStopRow::from_fact(row, 1));
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
        self.check()?;
        let month = period.to_string();

        let mut outcomes: BTreeMap<String, String> = self
            .client
            .query(&format!(
                "SELECT content_hash, outcome FROM {FACT_TABLE} FINAL WHERE force_id = ? AND month = ?"
            ))
            .bind(partition_key)
            .bind(&month)
            .fetch_all::<HashOutcome>()
            .await
            .map_err(|e| StoreError::backend(Layer::Aggregate, e))?
            .into_iter()
            .map(|r| (r.content_hash, r.outcome))
            .collect();

        for fact in self.facts.values() {
            if fact.force_id == partition_key && fact.month == month {
                outcomes.insert(fact.content_hash.clone(), fact.outcome.clone());
            }
        }

        Ok(outcomes.into_values().collect())
    }

    async fn upsert_aggregates(&mut self, rows: &[AggregateRow]) -> Result<(), StoreError> {
        self.check()?;
        let now = Utc::now().timestamp_millis();
        for row in rows {
            let stored = OutcomeCountRow {
                force_id: row.partition_key.clone(),
                month: row.period.to_string(),
                outcome: row.category.clone(),
                count: row.count,
                updated_at: now,
            };
            let key = (stored.force_id.clone(), stored.month.clone(), stored.outcome.clone());
            self.aggregates.insert(key, stored);
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.check()?;
        self.finished = true;

        let raw = insert_rows(&self.client, RAW_TABLE, self.raw.values(), Layer::Raw).await?;
        let facts = insert_rows(&self.client, FACT_TABLE, self.facts.values(), Layer::Fact).await?;
        let aggregates =
            insert_rows(&self.client, AGGREGATE_TABLE, self.aggregates.values(), Layer::Aggregate).await?;

        debug!(raw, facts, aggregates, "Flushed layer buffers to ClickHouse");
        Ok(())
    }

    async fn rollback(&mut self) {
        self.finished = true;
        self.raw.clear();
        self.facts.clear();
        self.aggregates.clear();
    }
}
