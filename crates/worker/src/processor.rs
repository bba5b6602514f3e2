//! Job processor: one job message in, one completion out.
//!
//! Flow per delivery:
//! 1. Decode the job (malformed jobs fail without fetching)
//! 2. Fetch the force's records for the month
//! 3. Upsert raw, fact and aggregate layers in one transaction
//! 4. Publish a completion message and notify the hub
//!
//! Completion publishing and notification are best-effort on both the
//! success and failure paths; neither changes the job outcome.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

use ingest_core::{CompletionMessage, Error, Job, JobEvent, Result};
use queue::{HandlerOutcome, Headers, MessageHandler, REDELIVERED_HEADER};
use store::UpsertEngine;
use telemetry::metrics;
use upstream::StopSearchClient;

use crate::notifications::NotificationHub;
use crate::publisher::Publisher;

pub struct JobProcessor {
    client: StopSearchClient,
    engine: UpsertEngine,
    publisher: Arc<dyn Publisher>,
    done_destination: String,
    hub: Arc<NotificationHub>,
}

impl JobProcessor {
    pub fn new(
        client: StopSearchClient,
        engine: UpsertEngine,
        publisher: Arc<dyn Publisher>,
        done_destination: impl Into<String>,
        hub: Arc<NotificationHub>,
    ) -> Self {
        Self {
            client,
            engine,
            publisher,
            done_destination: done_destination.into(),
            hub,
        }
    }

    /// Run one job message to completion and return the event it produced.
    pub async fn process(&self, body: &Value) -> (JobEvent, Result<()>) {
        let job = match Job::from_body(body) {
            Ok(job) => job,
            Err(e) => {
                let event = JobEvent::error(field(body, "force"), field(body, "month"), e.to_string());
                return (event, Err(e));
            }
        };

        match self.run(&job).await {
            Ok((fetched, inserted)) => (JobEvent::ok(&job, fetched, inserted), Ok(())),
            Err(e) => {
                let event = JobEvent::error(
                    Some(job.partition_key.clone()),
                    Some(job.period.to_string()),
                    e.to_string(),
                );
                (event, Err(e))
            }
        }
    }

    async fn run(&self, job: &Job) -> Result<(u64, u64)> {
        info!(force = %job.partition_key, month = %job.period, "Processing job");

        let records = self.client.stops_by_force(job).await?;
        let inserted = self
            .engine
            .upsert(&job.partition_key, job.period, &records)
            .await?;

        Ok((records.len() as u64, inserted))
    }

    /// Publish the completion message, then fan the event out.
    async fn finish(&self, event: &JobEvent) {
        let message = CompletionMessage::from(event);
        match serde_json::to_value(&message) {
            Ok(body) => {
                if let Err(e) = self.publisher.publish(&self.done_destination, &body).await {
                    metrics().completion_publish_failures.inc();
                    warn!(
                        destination = %self.done_destination,
                        event = %event.label(),
                        error = %e,
                        "Failed to publish completion message"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode completion message"),
        }

        self.hub.notify(event).await;
    }
}

fn field(body: &Value, key: &str) -> Option<String> {
    match body.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn classify(err: &Error) -> HandlerOutcome {
    if err.is_retryable() {
        HandlerOutcome::RetryableFailure(err.to_string())
    } else {
        HandlerOutcome::TerminalFailure(err.to_string())
    }
}

#[async_trait]
impl MessageHandler for JobProcessor {
    async fn handle(&self, body: &Value, headers: &Headers) -> HandlerOutcome {
        let redelivered = headers.contains_key(REDELIVERED_HEADER);
        let (event, result) = self.process(body).await;

        let outcome = match &result {
            Ok(()) => {
                metrics().jobs_ok.inc();
                metrics().rows_fetched.inc_by(event.rows_fetched);
                metrics().rows_inserted.inc_by(event.rows_inserted);
                info!(
                    job = %event.label(),
                    rows = event.rows_fetched,
                    inserted = event.rows_inserted,
                    redelivered,
                    "Job completed"
                );
                HandlerOutcome::Success
            }
            Err(e) => {
                metrics().jobs_failed.inc();
                error!(
                    job = %event.label(),
                    kind = e.kind().as_str(),
                    retryable = e.is_retryable(),
                    redelivered,
                    error = %e,
                    "Job failed"
                );
                classify(e)
            }
        };

        self.finish(&event).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::NotificationSink;
    use queue::TransportError;
    use serde_json::json;
    use std::sync::Mutex;
    use store::MemoryStore;
    use tokio::sync::mpsc;
    use upstream::{fast_policy, BackoffFetcher, UpstreamConfig};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct Captured {
        sent: Mutex<Vec<(String, Value)>>,
        fail: bool,
    }

    #[async_trait]
    impl Publisher for Captured {
        async fn publish(
            &self,
            destination: &str,
            message: &Value,
        ) -> std::result::Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::NotConnected);
            }
            self.sent
                .lock()
                .unwrap()
                .push((destination.to_string(), message.clone()));
            Ok(())
        }
    }

    struct Fixture {
        processor: JobProcessor,
        store: Arc<MemoryStore>,
        published: Arc<Captured>,
        events: mpsc::Receiver<JobEvent>,
    }

    fn fixture(server: &MockServer, fail_publish: bool) -> Fixture {
        let config = UpstreamConfig {
            base_url: server.uri(),
            rate_per_sec: 1_000.0,
            burst: Some(100),
            ..Default::default()
        };
        let fetcher = BackoffFetcher::from_config(&config)
            .unwrap()
            .with_policy(fast_policy(1));
        let client = StopSearchClient::new(Arc::new(fetcher), config.base_url);

        let store = Arc::new(MemoryStore::new());
        let published = Arc::new(Captured {
            fail: fail_publish,
            ..Default::default()
        });
        let (sender, events) = mpsc::channel(16);
        let hub = NotificationHub::new().with_sink(NotificationSink::Channel {
            name: "test".into(),
            sender,
        });

        Fixture {
            processor: JobProcessor::new(
                client,
                UpsertEngine::new(store.clone()),
                published.clone(),
                "police.done",
                Arc::new(hub),
            ),
            store,
            published,
            events,
        }
    }

    async fn mount_stops(server: &MockServer, body: Value) {
        Mock::given(method("GET"))
            .and(path("/stops-force"))
            .and(query_param("force", "metropolitan"))
            .and(query_param("date", "2024-05"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_success_publishes_completion_and_event() {
        let server = MockServer::start().await;
        mount_stops(&server, json!([{"outcome": "Arrest"}, {"outcome": "Nothing found"}])).await;
        let mut fx = fixture(&server, false);

        let outcome = fx
            .processor
            .handle(&json!({"force": "metropolitan", "month": "2024-05"}), &Headers::new())
            .await;

        assert_eq!(outcome, HandlerOutcome::Success);
        assert_eq!(fx.store.fact_count(), 2);

        let sent = fx.published.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "police.done");
        assert_eq!(
            sent[0].1,
            json!({"force": "metropolitan", "month": "2024-05", "rows": 2, "inserted": 2, "status": "ok"})
        );

        let event = fx.events.recv().await.unwrap();
        assert!(event.is_ok());
        assert_eq!(event.rows_inserted, 2);
    }

    #[tokio::test]
    async fn test_malformed_job_is_terminal_without_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;
        let mut fx = fixture(&server, false);

        let outcome = fx.processor.handle(&json!({"month": "2024-05"}), &Headers::new()).await;

        assert!(matches!(outcome, HandlerOutcome::TerminalFailure(_)));
        let sent = fx.published.sent.lock().unwrap().clone();
        assert_eq!(sent[0].1["status"], "error");
        assert_eq!(sent[0].1["force"], Value::Null);
        assert_eq!(sent[0].1["month"], "2024-05");
        assert!(sent[0].1["error"].as_str().unwrap().contains("missing force"));

        let event = fx.events.recv().await.unwrap();
        assert!(!event.is_ok());
    }

    #[tokio::test]
    async fn test_upstream_exhaustion_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let fx = fixture(&server, false);

        let outcome = fx
            .processor
            .handle(&json!({"force": "metropolitan", "month": "2024-05"}), &Headers::new())
            .await;

        assert!(matches!(outcome, HandlerOutcome::RetryableFailure(_)));
        assert_eq!(fx.store.raw_count(), 0);
    }

    #[tokio::test]
    async fn test_not_found_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let fx = fixture(&server, false);

        let outcome = fx
            .processor
            .handle(&json!({"force": "nowhere", "month": "2024-05"}), &Headers::new())
            .await;

        assert!(matches!(outcome, HandlerOutcome::TerminalFailure(_)));
    }

    #[tokio::test]
    async fn test_completion_publish_failure_does_not_fail_job() {
        let server = MockServer::start().await;
        mount_stops(&server, json!([{"outcome": "Arrest"}])).await;
        let mut fx = fixture(&server, true);

        let outcome = fx
            .processor
            .handle(&json!({"force": "metropolitan", "month": "2024-05"}), &Headers::new())
            .await;

        assert_eq!(outcome, HandlerOutcome::Success);
        assert!(fx.events.recv().await.unwrap().is_ok());
    }
}
