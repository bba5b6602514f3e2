//! Upstream access for the ingestion worker.
//!
//! Every outbound call goes through a process-local token bucket and is
//! retried with capped, jittered exponential backoff on network errors and
//! retryable statuses.

pub mod backoff;
pub mod client;
pub mod config;
pub mod fetcher;
pub mod limiter;

pub use backoff::*;
pub use client::*;
pub use config::*;
pub use fetcher::*;
pub use limiter::*;
