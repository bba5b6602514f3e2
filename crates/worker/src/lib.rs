//! Job processing for the ingestion worker.
//!
//! - Processor (job message → fetch → three-layer upsert → completion)
//! - Notifications (fault-isolated fan-out of job events)
//! - Email (SMTP delivery for the email sink)
//! - Producer (enqueueing discovered jobs)

pub mod config;
pub mod email;
pub mod notifications;
pub mod processor;
pub mod producer;
pub mod publisher;

pub use config::*;
pub use email::*;
pub use notifications::*;
pub use processor::*;
pub use producer::*;
pub use publisher::*;
