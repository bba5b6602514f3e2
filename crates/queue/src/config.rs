//! Broker configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a subscription starts reading when no offset has been committed
/// for the topic yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartOffset {
    /// Jobs enqueued before the first worker started are still processed.
    #[default]
    Earliest,
    Latest,
}

/// Queue client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Broker addresses
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    /// Job messages
    #[serde(default = "default_fetch_destination")]
    pub fetch_destination: String,
    /// Completion messages
    #[serde(default = "default_done_destination")]
    pub done_destination: String,
    /// JobEvents published by the broker reporter sink
    #[serde(default = "default_notify_destination")]
    pub notify_destination: String,
    /// Dead-letter destination
    #[serde(default = "default_dlq_destination")]
    pub dlq_destination: String,
    /// Dead-letter failed deliveries instead of nacking them
    #[serde(default = "default_dlq_on_error")]
    pub dlq_on_error: bool,
    /// Heartbeat interval requested on connect
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Fixed delay before reconnecting after an unexpected disconnect
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Reconnect-then-retry attempts for send/ack/nack
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,
    /// Longest a single receive call waits for a message
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on bytes per broker fetch
    #[serde(default = "default_max_fetch_bytes")]
    pub max_fetch_bytes: i32,
    #[serde(default)]
    pub start_offset: StartOffset,
    /// JSON file holding committed offsets; `None` keeps them in memory only
    #[serde(default = "default_offsets_path")]
    pub offsets_path: Option<String>,
    /// SASL username (enables TLS + SCRAM-SHA-256 when set with a password)
    #[serde(default)]
    pub sasl_username: Option<String>,
    #[serde(default)]
    pub sasl_password: Option<String>,
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_fetch_destination() -> String {
    "police.fetch".to_string()
}

fn default_done_destination() -> String {
    "police.done".to_string()
}

fn default_notify_destination() -> String {
    "police.notify".to_string()
}

fn default_dlq_destination() -> String {
    "police.dlq".to_string()
}

fn default_dlq_on_error() -> bool {
    true
}

fn default_offsets_path() -> Option<String> {
    Some("data/queue-offsets.json".to_string())
}

fn default_heartbeat_ms() -> u64 {
    10_000
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_transport_retries() -> u32 {
    2
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_fetch_bytes() -> i32 {
    1024 * 1024
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            fetch_destination: default_fetch_destination(),
            done_destination: default_done_destination(),
            notify_destination: default_notify_destination(),
            dlq_destination: default_dlq_destination(),
            dlq_on_error: default_dlq_on_error(),
            heartbeat_ms: default_heartbeat_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            transport_retries: default_transport_retries(),
            poll_interval_ms: default_poll_interval_ms(),
            max_fetch_bytes: default_max_fetch_bytes(),
            start_offset: StartOffset::default(),
            offsets_path: default_offsets_path(),
            sasl_username: None,
            sasl_password: None,
        }
    }
}

impl QueueConfig {
    /// Returns the broker list as a comma-separated string.
    pub fn broker_string(&self) -> String {
        self.brokers.join(",")
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// All destinations the worker reads or writes.
    pub fn destinations(&self) -> [&str; 4] {
        [
            &self.fetch_destination,
            &self.done_destination,
            &self.notify_destination,
            &self.dlq_destination,
        ]
    }

    pub fn sasl_credentials(&self) -> Option<(&str, &str)> {
        match (&self.sasl_username, &self.sasl_password) {
            (Some(u), Some(p)) if !u.is_empty() => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}
