//! Layer semantics against a real ClickHouse server.
//!
//! Requires Docker (or `STOPSEARCH_TEST_CLICKHOUSE_URL`), so ignored by
//! default: `cargo test -p integration-tests -- --ignored`.

use std::collections::BTreeMap;
use std::sync::Arc;

use ingest_core::{Period, RawRecord};
use integration_tests::containers::TestContainers;
use integration_tests::fixtures;
use store::{health, ClickHouseClient, ClickHouseStore, UpsertEngine};

async fn setup() -> (TestContainers, ClickHouseStore, UpsertEngine) {
    let containers = TestContainers::start().await;
    let client = ClickHouseClient::new(containers.store.clone());

    assert!(health::check_connection(&client).await, "ClickHouse not reachable");
    health::init_schema(&client)
        .await
        .expect("Failed to initialize schema");

    let store = ClickHouseStore::new(client);
    let engine = UpsertEngine::new(Arc::new(store.clone()));
    (containers, store, engine)
}

fn records(outcomes: &[&str], street_base: i64) -> Vec<RawRecord> {
    outcomes
        .iter()
        .enumerate()
        .map(|(i, outcome)| {
            RawRecord::new(fixtures::stop(outcome, "51.500000", street_base + i as i64))
        })
        .collect()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_upsert_and_replay_converge() {
    let (_containers, store, engine) = setup().await;
    // Distinct slice per test run so a shared server stays usable
    let force = format!("test-force-{}", std::process::id());
    let period: Period = "2024-05".parse().unwrap();
    let batch = records(&["Arrest", "Arrest", "", "Nothing found"], 10);

    let first = engine.upsert(&force, period, &batch).await.unwrap();
    let second = engine.upsert(&force, period, &batch).await.unwrap();

    assert_eq!(first, 4);
    assert_eq!(second, 0);
    assert_eq!(store.raw_count(&force, period).await.unwrap(), 4);
    assert_eq!(store.fact_count(&force, period).await.unwrap(), 4);
    assert_eq!(
        store.aggregates(&force, period).await.unwrap(),
        BTreeMap::from([
            ("Arrest".to_string(), 2),
            ("Nothing found".to_string(), 1),
            ("Unknown".to_string(), 1),
        ])
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_aggregate_counts_whole_slice_across_jobs() {
    let (_containers, store, engine) = setup().await;
    let force = format!("test-slice-{}", std::process::id());
    let period: Period = "2023-11".parse().unwrap();

    engine
        .upsert(&force, period, &records(&["Arrest"], 100))
        .await
        .unwrap();
    engine
        .upsert(&force, period, &records(&["Arrest", "Community resolution"], 200))
        .await
        .unwrap();

    let aggregates = store.aggregates(&force, period).await.unwrap();
    assert_eq!(aggregates["Arrest"], 2);
    assert_eq!(aggregates["Community resolution"], 1);
    assert_eq!(store.fact_count(&force, period).await.unwrap(), 3);
}
