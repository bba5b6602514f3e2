//! End-to-end tests for the job pipeline.
//!
//! job message → QueueClient → JobProcessor → police API (wiremock)
//! → UpsertEngine (memory store) → completion message + notifications

use std::collections::BTreeMap;
use std::sync::Arc;

use integration_tests::fixtures::{self, FORCE, MONTH};
use integration_tests::mocks::FailingPublisher;
use integration_tests::setup::{TestContext, DLQ, DONE, FETCH, NOTIFY};
use serde_json::json;
use telemetry::metrics;

#[tokio::test]
async fn test_two_record_month_lands_in_all_layers() {
    let mut ctx = TestContext::new(true).await;
    ctx.mount_stops(FORCE, MONTH, fixtures::two_stops()).await;
    ctx.transport().publish_json(FETCH, &fixtures::job_body(FORCE, MONTH));

    ctx.run_until(|ctx| ctx.transport().acked() == 1).await;

    assert_eq!(ctx.store.raw_count(), 2);
    assert_eq!(ctx.store.fact_count(), 2);
    assert_eq!(
        ctx.store.aggregates(FORCE, fixtures::period()),
        BTreeMap::from([("Nothing found".to_string(), 1), ("Arrest".to_string(), 1)])
    );

    assert_eq!(
        ctx.transport().sent_json(DONE),
        vec![json!({"force": FORCE, "month": MONTH, "rows": 2, "inserted": 2, "status": "ok"})]
    );

    let events = ctx.drain_events();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_ok());
    assert_eq!(events[0].rows_fetched, 2);
    assert_eq!(events[0].rows_inserted, 2);
}

#[tokio::test]
async fn test_every_sink_receives_the_event() {
    let ctx = TestContext::new(true).await;
    ctx.mount_stops(FORCE, MONTH, fixtures::two_stops()).await;
    ctx.transport().publish_json(FETCH, &fixtures::job_body(FORCE, MONTH));

    ctx.run_until(|ctx| ctx.transport().acked() == 1).await;

    let notified = ctx.transport().sent_json(NOTIFY);
    assert_eq!(notified.len(), 1);
    assert_eq!(notified[0]["force"], FORCE);
    assert_eq!(notified[0]["status"], "ok");

    let mails = ctx.mailer.messages();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].to, vec!["ops@example.org"]);
    assert!(mails[0].subject.contains("metropolitan 2024-05"));
}

#[tokio::test]
async fn test_redelivered_job_inserts_nothing_new() {
    let mut ctx = TestContext::new(true).await;
    ctx.mount_stops(FORCE, MONTH, fixtures::two_stops()).await;
    ctx.transport().publish_json(FETCH, &fixtures::job_body(FORCE, MONTH));
    ctx.transport().publish_json(FETCH, &fixtures::job_body(FORCE, MONTH));

    ctx.run_until(|ctx| ctx.transport().acked() == 2).await;

    assert_eq!(ctx.store.raw_count(), 2);
    assert_eq!(ctx.store.fact_count(), 2);
    assert_eq!(ctx.store.aggregates(FORCE, fixtures::period())["Arrest"], 1);

    let done = ctx.transport().sent_json(DONE);
    assert_eq!(done.len(), 2);
    assert_eq!(done[0]["inserted"], 2);
    assert_eq!(done[1]["inserted"], 0);
    assert_eq!(done[1]["rows"], 2);

    let inserted: Vec<u64> = ctx.drain_events().iter().map(|e| e.rows_inserted).collect();
    assert_eq!(inserted, vec![2, 0]);
}

#[tokio::test]
async fn test_non_list_body_completes_with_no_rows() {
    let ctx = TestContext::new(true).await;
    ctx.mount_stops(FORCE, MONTH, json!({"error": "no data"})).await;
    ctx.transport().publish_json(FETCH, &fixtures::job_body(FORCE, MONTH));

    ctx.run_until(|ctx| ctx.transport().acked() == 1).await;

    assert_eq!(ctx.store.raw_count(), 0);
    assert!(ctx.store.aggregates(FORCE, fixtures::period()).is_empty());
    let done = ctx.transport().sent_json(DONE);
    assert_eq!(done[0]["status"], "ok");
    assert_eq!(done[0]["rows"], 0);
}

#[tokio::test]
async fn test_failing_mailer_does_not_fail_job() {
    let ctx = TestContext::new(true).await;
    ctx.mailer.set_should_fail(true);
    ctx.mount_stops(FORCE, MONTH, fixtures::two_stops()).await;
    ctx.transport().publish_json(FETCH, &fixtures::job_body(FORCE, MONTH));

    ctx.run_until(|ctx| ctx.transport().acked() == 1).await;

    assert!(ctx.transport().sent_json(DLQ).is_empty());
    assert_eq!(ctx.transport().sent_json(NOTIFY).len(), 1);
    assert_eq!(ctx.store.fact_count(), 2);
}

#[tokio::test]
async fn test_unpublishable_completion_still_acks_job() {
    let publisher = Arc::new(FailingPublisher::default());
    let mut ctx = TestContext::with_publisher(true, publisher.clone()).await;
    ctx.mount_stops(FORCE, MONTH, fixtures::two_stops()).await;
    ctx.transport().publish_json(FETCH, &fixtures::job_body(FORCE, MONTH));

    let publish_failures = metrics().completion_publish_failures.get();
    let sink_failures = metrics().sink_failures.get();

    ctx.run_until(|ctx| ctx.transport().acked() == 1).await;

    // Completion message and broker sink both went to the failing publisher.
    assert_eq!(publisher.calls(), 2);
    assert!(metrics().completion_publish_failures.get() > publish_failures);
    assert!(metrics().sink_failures.get() > sink_failures);

    assert_eq!(ctx.transport().nacked(), 0);
    assert!(ctx.transport().sent_json(DLQ).is_empty());
    assert_eq!(ctx.store.fact_count(), 2);

    // The remaining sinks still saw the event.
    assert_eq!(ctx.mailer.messages().len(), 1);
    let events = ctx.drain_events();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_ok());
}
