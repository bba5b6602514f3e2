//! Outbound publishing capability used by the processor and broker sink.

use async_trait::async_trait;
use serde_json::Value;

use queue::{QueueClient, Transport, TransportError};

/// Something that can put a JSON message on a destination.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, destination: &str, message: &Value) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: Transport + 'static> Publisher for QueueClient<T> {
    async fn publish(&self, destination: &str, message: &Value) -> Result<(), TransportError> {
        self.send_json(destination, message).await
    }
}
