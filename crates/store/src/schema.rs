//! ClickHouse table schemas for the three layers.
//!
//! - raw rows are kept once per content hash
//! - facts are versioned; `FINAL` reads return the latest version per hash
//! - aggregate rows are replaced per `(force_id, month, outcome)` by
//!   `updated_at`

pub const RAW_TABLE: &str = "raw_stop_search";
pub const FACT_TABLE: &str = "fact_stop_search";
pub const AGGREGATE_TABLE: &str = "agg_monthly_outcomes";

pub fn create_database(database: &str) -> String {
    format!("CREATE DATABASE IF NOT EXISTS {database}")
}

/// Unmodified upstream documents.
pub fn create_raw_table(database: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {database}.{RAW_TABLE} (
    content_hash String,
    force_id LowCardinality(String),
    month String,
    raw_payload String,
    ingested_at DateTime64(3, 'UTC')
)
ENGINE = ReplacingMergeTree
ORDER BY content_hash
"#
    )
}

/// One typed row per logical stop, latest `version` wins.
pub fn create_fact_table(database: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {database}.{FACT_TABLE} (
    content_hash String,
    force_id LowCardinality(String),
    month String,
    stop_datetime Nullable(DateTime64(3, 'UTC')),
    search_type Nullable(String),
    involved_person Nullable(Bool),
    gender Nullable(String),
    age_range Nullable(String),
    self_defined_ethnicity Nullable(String),
    officer_defined_ethnicity Nullable(String),
    legislation Nullable(String),
    object_of_search Nullable(String),
    outcome String,
    outcome_linked_to_object_of_search Nullable(Bool),
    outcome_object_id Nullable(String),
    outcome_object_name Nullable(String),
    removal_of_more_than_outer_clothing Nullable(Bool),
    operation Nullable(Bool),
    operation_name Nullable(String),
    location_type Nullable(String),
    latitude Nullable(Float64),
    longitude Nullable(Float64),
    street_id Nullable(Int64),
    street_name Nullable(String),
    version UInt64
)
ENGINE = ReplacingMergeTree(version)
PARTITION BY month
ORDER BY content_hash
"#
    )
}

/// Per-slice outcome counts.
pub fn create_aggregate_table(database: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {database}.{AGGREGATE_TABLE} (
    force_id LowCardinality(String),
    month String,
    outcome String,
    count UInt64,
    updated_at DateTime64(3, 'UTC')
)
ENGINE = ReplacingMergeTree(updated_at)
ORDER BY (force_id, month, outcome)
"#
    )
}

/// All DDL in execution order.
pub fn all_tables(database: &str) -> Vec<String> {
    vec![
        create_raw_table(database),
        create_fact_table(database),
        create_aggregate_table(database),
    ]
}
