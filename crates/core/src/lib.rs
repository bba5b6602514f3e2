//! Core types for the stop-and-search ingestion worker.
//!
//! Jobs and their wire messages, raw records and content hashing, the
//! pure raw-to-fact transform, aggregate rollups and the error taxonomy.

pub mod aggregate;
pub mod error;
pub mod event;
pub mod fact;
pub mod job;
pub mod record;

pub use aggregate::*;
pub use error::{Error, ErrorKind, Result};
pub use event::*;
pub use fact::*;
pub use job::*;
pub use record::*;
