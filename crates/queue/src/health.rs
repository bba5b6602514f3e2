//! Redpanda health checks and topic provisioning.

use std::collections::HashSet;
use tracing::{debug, error, info};

use crate::config::QueueConfig;
use crate::redpanda::client_builder;
use crate::transport::TransportError;

/// Check Redpanda connection health.
pub async fn check_connection(config: &QueueConfig) -> bool {
    match client_builder(config).build().await {
        Ok(client) => match client.list_topics().await {
            Ok(topics) => {
                debug!(topics = topics.len(), "Redpanda connection healthy");
                true
            }
            Err(e) => {
                error!("Failed to list Redpanda topics: {}", e);
                false
            }
        },
        Err(e) => {
            error!("Failed to connect to Redpanda: {}", e);
            false
        }
    }
}

/// Create any of the worker's destinations that do not exist yet, with one
/// partition each. Returns the topics that were created.
pub async fn ensure_topics(
    config: &QueueConfig,
    replication_factor: i16,
) -> Result<Vec<String>, TransportError> {
    let client = client_builder(config)
        .build()
        .await
        .map_err(|e| TransportError::BrokenPipe(format!("failed to connect to Redpanda: {e}")))?;

    let existing: HashSet<String> = client
        .list_topics()
        .await
        .map_err(|e| TransportError::Protocol(format!("failed to list topics: {e}")))?
        .into_iter()
        .map(|t| t.name)
        .collect();

    let missing: Vec<String> = config
        .destinations()
        .iter()
        .filter(|t| !existing.contains(**t))
        .map(|t| t.to_string())
        .collect();

    if missing.is_empty() {
        return Ok(missing);
    }

    let controller = client
        .controller_client()
        .map_err(|e| TransportError::Protocol(format!("no controller client: {e}")))?;

    for topic in &missing {
        controller
            .create_topic(topic.clone(), 1, replication_factor, 5_000)
            .await
            .map_err(|e| TransportError::Protocol(format!("failed to create topic {topic}: {e}")))?;
        info!(topic = %topic, replication_factor, "Created topic");
    }

    Ok(missing)
}
