//! Failure paths: dead-lettering, redelivery and malformed jobs.

use integration_tests::fixtures::{self, FORCE, MONTH};
use integration_tests::setup::{TestContext, DLQ, DONE, FETCH, NOTIFY};
use serde_json::json;

#[tokio::test]
async fn test_upstream_failure_is_dead_lettered_once() {
    let mut ctx = TestContext::new(true).await;
    ctx.mount_status(503).await;
    ctx.transport().publish_json(FETCH, &fixtures::job_body(FORCE, MONTH));

    ctx.run_until(|ctx| ctx.transport().acked() == 1).await;

    let dead = ctx.transport().sent_json(DLQ);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0]["original_body"], fixtures::job_body(FORCE, MONTH));
    assert!(dead[0]["error"].as_str().unwrap().starts_with("retryable: "));
    assert!(dead[0]["headers"].is_object());

    assert_eq!(ctx.transport().nacked(), 0);
    assert_eq!(ctx.transport().pending(FETCH), 0);
    assert_eq!(ctx.store.raw_count(), 0);

    let done = ctx.transport().sent_json(DONE);
    assert_eq!(done[0]["status"], "error");
    assert_eq!(done[0]["force"], FORCE);

    let events = ctx.drain_events();
    assert_eq!(events.len(), 1);
    assert!(!events[0].is_ok());
}

#[tokio::test]
async fn test_failure_without_dlq_is_redelivered() {
    let ctx = TestContext::new(false).await;
    ctx.mount_status(503).await;
    ctx.transport().publish_json(FETCH, &fixtures::job_body(FORCE, MONTH));

    ctx.run_until(|ctx| ctx.transport().nacked() >= 2).await;

    assert!(ctx.transport().sent_json(DLQ).is_empty());
    assert_eq!(ctx.transport().acked(), 0);
    assert!(ctx.transport().sent_json(DONE).len() >= 2);
}

#[tokio::test]
async fn test_missing_force_is_terminal_and_skips_fetch() {
    let ctx = TestContext::new(true).await;
    ctx.transport().publish_json(FETCH, &json!({"month": MONTH}));

    ctx.run_until(|ctx| ctx.transport().acked() == 1).await;

    let dead = ctx.transport().sent_json(DLQ);
    assert_eq!(dead.len(), 1);
    assert!(dead[0]["error"].as_str().unwrap().starts_with("terminal: "));

    let requests = ctx.upstream.received_requests().await.unwrap_or_default();
    assert!(requests.is_empty());

    let done = ctx.transport().sent_json(DONE);
    assert_eq!(done[0]["status"], "error");
    assert_eq!(done[0]["force"], serde_json::Value::Null);
    assert_eq!(done[0]["month"], MONTH);
}

#[tokio::test]
async fn test_non_json_body_is_dead_lettered_as_raw() {
    let ctx = TestContext::new(true).await;
    ctx.transport().publish_raw(FETCH, b"metropolitan 2024-05".to_vec());

    ctx.run_until(|ctx| ctx.transport().acked() == 1).await;

    let dead = ctx.transport().sent_json(DLQ);
    assert_eq!(dead[0]["original_body"], json!({"raw": "metropolitan 2024-05"}));
}

#[tokio::test]
async fn test_bad_month_notifies_error_event() {
    let mut ctx = TestContext::new(true).await;
    ctx.transport().publish_json(FETCH, &json!({"force": FORCE, "month": "2024-13"}));

    ctx.run_until(|ctx| ctx.transport().acked() == 1).await;

    let notified = ctx.transport().sent_json(NOTIFY);
    assert_eq!(notified.len(), 1);
    assert_eq!(notified[0]["status"], "error");

    let events = ctx.drain_events();
    assert_eq!(events[0].period.as_deref(), Some("2024-13"));
    assert_eq!(events[0].partition_key.as_deref(), Some(FORCE));
}

#[tokio::test]
async fn test_worker_survives_failure_and_processes_next_job() {
    let ctx = TestContext::new(true).await;
    ctx.mount_stops(FORCE, MONTH, fixtures::two_stops()).await;
    ctx.transport().publish_json(FETCH, &json!({"force": ""}));
    ctx.transport().publish_json(FETCH, &fixtures::job_body(FORCE, MONTH));

    ctx.run_until(|ctx| ctx.transport().acked() == 2).await;

    assert_eq!(ctx.transport().sent_json(DLQ).len(), 1);
    assert_eq!(ctx.store.fact_count(), 2);
}
