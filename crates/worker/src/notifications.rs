//! Fan-out of job events to notification sinks.
//!
//! Sinks run in attachment order. A failing sink is logged and counted;
//! it never stops later sinks and never reaches the caller.

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use ingest_core::{Error, JobEvent, Result};
use telemetry::metrics;

use crate::config::EmailConfig;
use crate::email::{EmailMessage, Mailer};
use crate::publisher::Publisher;

/// Closed set of event sinks.
#[derive(Clone)]
pub enum NotificationSink {
    /// Structured log line per event
    Log,
    /// JSON event on a broker destination
    Broker {
        publisher: Arc<dyn Publisher>,
        destination: String,
    },
    /// HTML summary email
    Email {
        mailer: Arc<dyn Mailer>,
        config: EmailConfig,
    },
    /// In-process channel
    Channel {
        name: String,
        sender: mpsc::Sender<JobEvent>,
    },
}

impl NotificationSink {
    /// Identity used for attach/detach.
    pub fn name(&self) -> String {
        match self {
            Self::Log => "log".to_string(),
            Self::Broker { destination, .. } => format!("broker:{destination}"),
            Self::Email { .. } => "email".to_string(),
            Self::Channel { name, .. } => format!("channel:{name}"),
        }
    }

    pub async fn update(&self, event: &JobEvent) -> Result<()> {
        match self {
            Self::Log => {
                if event.is_ok() {
                    info!(
                        force = event.partition_key.as_deref().unwrap_or_default(),
                        month = event.period.as_deref().unwrap_or_default(),
                        rows = event.rows_fetched,
                        inserted = event.rows_inserted,
                        "Job completed"
                    );
                } else {
                    error!(
                        force = event.partition_key.as_deref().unwrap_or_default(),
                        month = event.period.as_deref().unwrap_or_default(),
                        message = event.message.as_deref().unwrap_or_default(),
                        "Job failed"
                    );
                }
                Ok(())
            }
            Self::Broker {
                publisher,
                destination,
            } => {
                let message = serde_json::to_value(event)?;
                publisher
                    .publish(destination, &message)
                    .await
                    .map_err(|e| Error::sink(format!("broker sink: {e}")))
            }
            Self::Email { mailer, config } => {
                if !config.has_recipients() {
                    debug!(event = %event.label(), "No email recipients, email not sent");
                    return Ok(());
                }
                mailer.send(&EmailMessage::for_event(event, config)?).await
            }
            Self::Channel { name, sender } => sender
                .send(event.clone())
                .await
                .map_err(|_| Error::sink(format!("channel {name} closed"))),
        }
    }
}

impl fmt::Debug for NotificationSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NotificationSink").field(&self.name()).finish()
    }
}

/// Event fan-out, built at start-up and shared by reference.
#[derive(Debug, Default)]
pub struct NotificationHub {
    sinks: Vec<NotificationSink>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: NotificationSink) -> Self {
        self.attach(sink);
        self
    }

    /// Attach a sink. A sink whose name is already attached is ignored.
    pub fn attach(&mut self, sink: NotificationSink) -> bool {
        let name = sink.name();
        if self.sinks.iter().any(|s| s.name() == name) {
            return false;
        }
        debug!(sink = %name, "Sink attached");
        self.sinks.push(sink);
        true
    }

    pub fn detach(&mut self, name: &str) -> bool {
        let before = self.sinks.len();
        self.sinks.retain(|s| s.name() != name);
        before != self.sinks.len()
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(NotificationSink::name).collect()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Deliver `event` to every sink. Returns how many sinks failed.
    pub async fn notify(&self, event: &JobEvent) -> usize {
        let mut failures = 0;
        for sink in &self.sinks {
            if let Err(e) = sink.update(event).await {
                failures += 1;
                metrics().sink_failures.inc();
                warn!(sink = %sink.name(), event = %event.label(), error = %e, "Notification sink failed");
            }
        }
        failures
    }
}
