//! Layered storage for stop-and-search records.
//!
//! [`UpsertEngine`] writes one job's records into the raw, fact and
//! aggregate layers inside a single [`LayerTransaction`]. Backends:
//! [`MemoryStore`] for tests and local runs, [`ClickHouseStore`] for
//! production.

pub mod client;
pub mod clickhouse_store;
pub mod config;
pub mod engine;
pub mod health;
pub mod layers;
pub mod memory;
pub mod schema;

pub use clickhouse_store::*;
pub use client::*;
pub use config::*;
pub use engine::*;
pub use layers::*;
pub use memory::*;
