//! Broker access for the ingestion worker.
//!
//! [`QueueClient`] drives a subscribe loop over any [`Transport`], invoking
//! a [`MessageHandler`] once per delivery and settling each message with an
//! explicit ack, nack or dead-letter publish. Transports are swappable:
//! [`InMemoryTransport`] for tests and local runs, [`RedpandaTransport`]
//! for a Kafka-compatible cluster, which resumes from offsets kept in an
//! [`OffsetStore`].

pub mod client;
pub mod config;
pub mod handler;
pub mod health;
pub mod memory;
pub mod offsets;
pub mod redpanda;
pub mod transport;

pub use client::*;
pub use config::*;
pub use handler::*;
pub use memory::*;
pub use offsets::*;
pub use redpanda::*;
pub use transport::*;
