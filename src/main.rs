//! Stop-and-search ingestion worker
//!
//! Pulls `(force, month)` jobs from the broker and for each one:
//! - fetches the month's records from the police open-data API
//! - lands them in the raw, fact and aggregate ClickHouse layers
//! - publishes a completion message and notifies the configured sinks
//!
//! `stopsearch-ingest enqueue` instead publishes every job from the
//! configured start month through the last full month, then exits.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::signal;
use tracing::{error, info, warn};

use ingest_core::{discover_jobs, Period};
use queue::{QueueClient, QueueConfig, RedpandaTransport};
use store::{ClickHouseClient, ClickHouseStore, StoreConfig, UpsertEngine};
use telemetry::{health, init_tracing_from_env, metrics};
use upstream::{StopSearchClient, UpstreamConfig};
use worker::{
    enqueue_jobs, JobProcessor, NotificationHub, NotificationSink, NotificationsConfig,
    ProducerConfig, Publisher, SmtpMailer,
};

/// Application configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Config {
    #[serde(default)]
    queue: QueueConfig,

    #[serde(default)]
    store: StoreConfig,

    #[serde(default)]
    upstream: UpstreamConfig,

    #[serde(default)]
    notifications: NotificationsConfig,

    #[serde(default)]
    producer: ProducerConfig,

    /// Replication factor for topics created at start-up
    #[serde(default = "default_topic_replication")]
    topic_replication: i16,
}

fn default_topic_replication() -> i16 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            store: StoreConfig::default(),
            upstream: UpstreamConfig::default(),
            notifications: NotificationsConfig::default(),
            producer: ProducerConfig::default(),
            topic_replication: default_topic_replication(),
        }
    }
}

enum Mode {
    Worker,
    Enqueue,
}

#[tokio::main]
async fn main() -> Result<()> {
    // rustls 0.23+ needs a process-wide crypto provider before any TLS use
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    init_tracing_from_env();

    let mode = match std::env::args().nth(1).as_deref() {
        None | Some("worker") => Mode::Worker,
        Some("enqueue") => Mode::Enqueue,
        Some(other) => bail!("unknown command {other:?}, expected `worker` or `enqueue`"),
    };

    info!("Starting stopsearch-ingest v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    info!(
        brokers = %config.queue.broker_string(),
        fetch = %config.queue.fetch_destination,
        dlq_on_error = config.queue.dlq_on_error,
        clickhouse = %config.store.url,
        api = %config.upstream.base_url,
        "Loaded config"
    );

    match queue::health::ensure_topics(&config.queue, config.topic_replication).await {
        Ok(created) if !created.is_empty() => info!(topics = ?created, "Created topics"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Could not ensure topics, continuing"),
    }

    let queue = Arc::new(QueueClient::new(
        RedpandaTransport::new(config.queue.clone()),
        config.queue.clone(),
    ));

    match mode {
        Mode::Enqueue => enqueue(&config, queue).await,
        Mode::Worker => run_worker(&config, queue).await,
    }
}

async fn run_worker(config: &Config, queue: Arc<QueueClient<RedpandaTransport>>) -> Result<()> {
    let clickhouse = ClickHouseClient::new(config.store.clone());
    if config.store.init_schema {
        if let Err(e) = store::health::init_schema(&clickhouse).await {
            // Tables may already exist under a user without DDL rights
            error!("Failed to initialize ClickHouse schema: {}", e);
        }
    }
    check_health(config, &clickhouse).await;

    let client = StopSearchClient::from_config(&config.upstream)
        .context("Failed to create upstream client")?;
    let engine = UpsertEngine::new(Arc::new(ClickHouseStore::new(clickhouse)));
    let publisher: Arc<dyn Publisher> = queue.clone();
    let hub = Arc::new(build_hub(&config.notifications, &config.queue, publisher.clone()));
    info!(sinks = ?hub.sink_names(), "Notification hub ready");

    let processor = Arc::new(JobProcessor::new(
        client,
        engine,
        publisher,
        config.queue.done_destination.clone(),
        hub,
    ));

    let destination = config.queue.fetch_destination.clone();
    let subscriber = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.subscribe(&destination, processor.as_ref()).await })
    };

    shutdown_signal().await;
    info!("Shutting down...");

    // The in-flight job finishes before the loop observes the close
    queue.close();
    match subscriber.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Subscribe loop ended with error: {}", e),
        Err(e) => error!("Subscribe task panicked: {}", e),
    }
    queue.disconnect().await;

    let snapshot = metrics().snapshot();
    info!(
        jobs_ok = snapshot.jobs_ok,
        jobs_failed = snapshot.jobs_failed,
        rows_inserted = snapshot.rows_inserted,
        dead_lettered = snapshot.messages_dead_lettered,
        "Shutdown complete"
    );
    Ok(())
}

async fn enqueue(config: &Config, queue: Arc<QueueClient<RedpandaTransport>>) -> Result<()> {
    let start: Period = config
        .producer
        .start_month
        .parse()
        .context("Invalid producer start month")?;
    let forces = config.producer.force_list();
    let jobs = discover_jobs(start, &forces, chrono::Utc::now().date_naive());

    info!(start = %start, forces = ?forces, jobs = jobs.len(), "Enqueueing jobs");
    let sent = enqueue_jobs(queue.as_ref(), &config.queue.fetch_destination, &jobs)
        .await
        .context("Failed to enqueue jobs")?;
    queue.disconnect().await;

    info!(sent, "Enqueue complete");
    Ok(())
}

fn build_hub(
    notifications: &NotificationsConfig,
    queue: &QueueConfig,
    publisher: Arc<dyn Publisher>,
) -> NotificationHub {
    let mut hub = NotificationHub::new();

    if notifications.log_reporter {
        hub.attach(NotificationSink::Log);
    }
    if notifications.broker_reporter {
        hub.attach(NotificationSink::Broker {
            publisher,
            destination: queue.notify_destination.clone(),
        });
    }
    if notifications.email.has_recipients() {
        hub.attach(NotificationSink::Email {
            mailer: Arc::new(SmtpMailer::new(&notifications.smtp)),
            config: notifications.email.clone(),
        });
    }

    hub
}

/// Load configuration from files and environment.
fn load_config() -> Result<Config> {
    let config = config::Config::builder()
        .add_source(config::Config::try_from(&Config::default())?)
        .add_source(
            config::File::with_name("config/default")
                .required(false)
                .format(config::FileFormat::Toml),
        )
        .add_source(
            config::Environment::default()
                .separator("__")
                .prefix("STOPSEARCH")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let mut config: Config = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    apply_env_overrides(&mut config)?;
    Ok(config)
}

fn env(name: &str) -> Option<String> {
    std::env::var(format!("STOPSEARCH_{name}")).ok()
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("STOPSEARCH_{name}={raw:?}: {e}")),
        None => Ok(None),
    }
}

fn parse_flag(name: &str) -> Option<bool> {
    env(name).map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// Flat variables for the commonly set fields. The config crate's nested
/// parsing does not cope with underscored field names.
fn apply_env_overrides(config: &mut Config) -> Result<()> {
    // Queue
    if let Some(brokers) = env("QUEUE_BROKERS") {
        config.queue.brokers = brokers.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(dest) = env("QUEUE_FETCH") {
        config.queue.fetch_destination = dest;
    }
    if let Some(dest) = env("QUEUE_DONE") {
        config.queue.done_destination = dest;
    }
    if let Some(dest) = env("QUEUE_NOTIFY") {
        config.queue.notify_destination = dest;
    }
    if let Some(dest) = env("QUEUE_DLQ") {
        config.queue.dlq_destination = dest;
    }
    if let Some(enabled) = parse_flag("DLQ_ON_ERROR") {
        config.queue.dlq_on_error = enabled;
    }
    if let Some(username) = env("QUEUE_SASL_USERNAME") {
        config.queue.sasl_username = Some(username);
    }
    if let Some(password) = env("QUEUE_SASL_PASSWORD") {
        config.queue.sasl_password = Some(password);
    }
    // Empty keeps committed offsets in memory only
    if let Some(path) = env("QUEUE_OFFSETS_PATH") {
        config.queue.offsets_path = Some(path).filter(|p| !p.trim().is_empty());
    }

    // Store
    if let Some(url) = env("CLICKHOUSE_URL") {
        config.store.url = url;
    }
    if let Some(database) = env("CLICKHOUSE_DATABASE") {
        config.store.database = database;
    }
    if let Some(username) = env("CLICKHOUSE_USERNAME") {
        config.store.username = Some(username);
    }
    if let Some(password) = env("CLICKHOUSE_PASSWORD") {
        config.store.password = Some(password);
    }

    // Upstream
    if let Some(base) = env("API_BASE") {
        config.upstream.base_url = base;
    }
    if let Some(rps) = parse_env::<f64>("API_RPS")? {
        if rps <= 0.0 {
            bail!("STOPSEARCH_API_RPS must be positive, got {rps}");
        }
        config.upstream.rate_per_sec = rps;
    }
    if let Some(burst) = parse_env::<u32>("API_BURST")? {
        config.upstream.burst = Some(burst);
    }
    if let Some(retries) = parse_env::<u32>("API_MAX_RETRIES")? {
        config.upstream.max_retries = retries;
    }
    if let Some(base) = parse_env::<f64>("API_BACKOFF_BASE")? {
        config.upstream.backoff_base_secs = base;
    }
    if let Some(cap) = parse_env::<f64>("API_BACKOFF_CAP")? {
        config.upstream.backoff_cap_secs = cap;
    }

    // Notifications
    if let Some(enabled) = parse_flag("ENABLE_BROKER_REPORTER") {
        config.notifications.broker_reporter = enabled;
    }
    if let Some(to) = env("EMAIL_TO") {
        config.notifications.email.to = to;
    }
    if let Some(cc) = env("EMAIL_CC") {
        config.notifications.email.cc = cc;
    }
    if let Some(from) = env("EMAIL_FROM") {
        config.notifications.email.from = from;
    }
    if let Some(host) = env("SMTP_HOST") {
        config.notifications.smtp.host = host;
    }
    if let Some(port) = parse_env::<u16>("SMTP_PORT")? {
        config.notifications.smtp.port = port;
    }

    // Producer
    if let Some(start) = env("START_MONTH") {
        config.producer.start_month = start;
    }
    if let Some(forces) = env("FORCES") {
        config.producer.forces = forces;
    }

    Ok(())
}

/// Check component health on startup.
async fn check_health(config: &Config, clickhouse: &ClickHouseClient) {
    if queue::health::check_connection(&config.queue).await {
        health().broker.set_healthy();
        info!("Broker connection: healthy");
    } else {
        health().broker.set_unhealthy("Connection failed");
        error!("Broker connection: unhealthy");
    }

    if store::health::check_connection(clickhouse).await {
        health().store.set_healthy();
        info!("ClickHouse connection: healthy");
    } else {
        health().store.set_unhealthy("Connection failed");
        error!("ClickHouse connection: unhealthy");
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
