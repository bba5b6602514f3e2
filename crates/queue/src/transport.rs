//! Broker transport capability.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Message headers. Values are text on every transport.
pub type Headers = BTreeMap<String, String>;

/// Header set by transports on a message delivered more than once.
pub const REDELIVERED_HEADER: &str = "redelivered";

/// Header carrying a per-send unique id.
pub const MESSAGE_ID_HEADER: &str = "message-id";

/// One message handed to the subscriber, to be acked or nacked exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Transport-assigned id used to settle this delivery
    pub id: String,
    pub destination: String,
    pub body: Vec<u8>,
    pub headers: Headers,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.headers
            .get(REDELIVERED_HEADER)
            .is_some_and(|v| v == "true")
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("broken pipe: {0}")]
    BrokenPipe(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Committed offsets could not be read or persisted.
    #[error("offset store: {0}")]
    Offsets(String),

    /// The transport was shut down; no further deliveries will arrive.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Connection-level failures are cured by reconnecting.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::NotConnected | Self::BrokenPipe(_))
    }
}

impl From<TransportError> for ingest_core::Error {
    fn from(e: TransportError) -> Self {
        ingest_core::Error::transport(e.to_string())
    }
}

/// A broker connection with explicit, per-message acknowledgment.
///
/// Implementations never auto-ack. A delivery returned by `receive` stays
/// in flight until `ack` or `nack` is called for it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open (or re-open) the connection.
    async fn connect(&self, heartbeat: Duration) -> Result<(), TransportError>;

    /// Drop the connection. Never fails.
    async fn disconnect(&self);

    /// Register for deliveries on `destination`. Must be repeated after
    /// every reconnect.
    async fn subscribe(&self, destination: &str) -> Result<(), TransportError>;

    /// Wait up to `wait` for the next delivery on a subscribed destination.
    async fn receive(
        &self,
        destination: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, TransportError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Return the delivery to the broker for redelivery.
    async fn nack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    async fn send(
        &self,
        destination: &str,
        body: &[u8],
        headers: &Headers,
    ) -> Result<(), TransportError>;
}
