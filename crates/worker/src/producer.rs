//! Enqueueing of discovered `(force, month)` jobs.

use tracing::{debug, info};

use ingest_core::{Error, Job, Result};

use crate::publisher::Publisher;

/// Publish one job message per job, in order. Stops at the first failed
/// publish and reports how far it got in the error.
pub async fn enqueue_jobs<P>(publisher: &P, destination: &str, jobs: &[Job]) -> Result<usize>
where
    P: Publisher + ?Sized,
{
    for (sent, job) in jobs.iter().enumerate() {
        let body = serde_json::to_value(job)?;
        publisher.publish(destination, &body).await.map_err(|e| {
            Error::transport(format!("enqueued {sent} of {} jobs, then: {e}", jobs.len()))
        })?;
        debug!(force = %job.partition_key, month = %job.period, "Enqueued job");
    }

    info!(destination, jobs = jobs.len(), "Done enqueueing");
    Ok(jobs.len())
}
