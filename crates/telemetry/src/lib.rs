//! Internal telemetry for the stop-and-search ingestion worker.
//!
//! Structured logging through `tracing`, plus in-process counters and a
//! health registry. Nothing here exposes a scrape endpoint.

pub mod health;
pub mod metrics;
pub mod tracing_setup;

pub use health::*;
pub use metrics::*;
pub use tracing_setup::*;
