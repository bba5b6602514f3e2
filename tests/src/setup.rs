//! Common test setup.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ingest_core::JobEvent;
use queue::{InMemoryTransport, QueueClient, QueueConfig};
use store::{MemoryStore, UpsertEngine};
use upstream::{fast_policy, BackoffFetcher, StopSearchClient, UpstreamConfig};
use worker::{EmailConfig, JobProcessor, NotificationHub, NotificationSink, Publisher};

use crate::mocks::CapturingMailer;

pub const FETCH: &str = "police.fetch";
pub const DONE: &str = "police.done";
pub const NOTIFY: &str = "police.notify";
pub const DLQ: &str = "police.dlq";

/// Worker wired to in-process collaborators.
///
/// - in-memory transport behind a real `QueueClient`
/// - in-memory layer store behind a real `UpsertEngine`
/// - wiremock standing in for the police API
/// - hub with log, broker, email (capturing mailer) and channel sinks
pub struct TestContext {
    pub queue: Arc<QueueClient<InMemoryTransport>>,
    pub store: Arc<MemoryStore>,
    pub upstream: MockServer,
    pub mailer: Arc<CapturingMailer>,
    pub processor: Arc<JobProcessor>,
    pub events: mpsc::Receiver<JobEvent>,
}

impl TestContext {
    pub async fn new(dlq_on_error: bool) -> Self {
        Self::build(dlq_on_error, None).await
    }

    /// Completion messages and the broker sink go through `publisher`
    /// instead of the queue client.
    pub async fn with_publisher(dlq_on_error: bool, publisher: Arc<dyn Publisher>) -> Self {
        Self::build(dlq_on_error, Some(publisher)).await
    }

    async fn build(dlq_on_error: bool, publisher: Option<Arc<dyn Publisher>>) -> Self {
        let upstream = MockServer::start().await;

        let queue_config = QueueConfig {
            dlq_on_error,
            reconnect_delay_ms: 1,
            poll_interval_ms: 5,
            ..Default::default()
        };
        let queue = Arc::new(QueueClient::new(InMemoryTransport::new(), queue_config));

        let upstream_config = UpstreamConfig {
            base_url: upstream.uri(),
            rate_per_sec: 1_000.0,
            burst: Some(100),
            ..Default::default()
        };
        let fetcher = BackoffFetcher::from_config(&upstream_config)
            .expect("Failed to create fetcher")
            .with_policy(fast_policy(2));
        let client = StopSearchClient::new(Arc::new(fetcher), upstream_config.base_url);

        let store = Arc::new(MemoryStore::new());
        let mailer = Arc::new(CapturingMailer::new());
        let (sender, events) = mpsc::channel(64);

        let publisher: Arc<dyn Publisher> = publisher.unwrap_or_else(|| queue.clone());
        let hub = NotificationHub::new()
            .with_sink(NotificationSink::Log)
            .with_sink(NotificationSink::Broker {
                publisher: publisher.clone(),
                destination: NOTIFY.to_string(),
            })
            .with_sink(NotificationSink::Email {
                mailer: mailer.clone(),
                config: EmailConfig {
                    to: "ops@example.org".into(),
                    ..Default::default()
                },
            })
            .with_sink(NotificationSink::Channel {
                name: "test".into(),
                sender,
            });

        let processor = Arc::new(JobProcessor::new(
            client,
            UpsertEngine::new(store.clone()),
            publisher,
            DONE,
            Arc::new(hub),
        ));

        Self {
            queue,
            store,
            upstream,
            mailer,
            processor,
            events,
        }
    }

    pub fn transport(&self) -> &InMemoryTransport {
        self.queue.transport()
    }

    /// Serve `body` for one force and month.
    pub async fn mount_stops(&self, force: &str, month: &str, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/stops-force"))
            .and(query_param("force", force))
            .and(query_param("date", month))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.upstream)
            .await;
    }

    /// Answer every upstream call with `status`.
    pub async fn mount_status(&self, status: u16) {
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.upstream)
            .await;
    }

    /// Run the subscribe loop on the fetch destination until `done` holds,
    /// then close it and wait for it to stop.
    pub async fn run_until(&self, done: impl Fn(&TestContext) -> bool) {
        let queue = self.queue.clone();
        let processor = self.processor.clone();
        let task = tokio::spawn(async move { queue.subscribe(FETCH, processor.as_ref()).await });

        tokio::time::timeout(Duration::from_secs(10), async {
            while !done(self) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");

        self.queue.close();
        task.await
            .expect("subscribe task panicked")
            .expect("subscribe loop failed");
    }

    /// Every event the channel sink has received so far.
    pub fn drain_events(&mut self) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
