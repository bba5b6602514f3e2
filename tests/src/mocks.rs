//! Mock collaborators for the notification sinks.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};

use ingest_core::{Error, Result};
use queue::TransportError;
use worker::{EmailMessage, Mailer, Publisher};

/// Mailer that keeps every message instead of sending it.
#[derive(Default)]
pub struct CapturingMailer {
    messages: Mutex<Vec<EmailMessage>>,
    should_fail: Mutex<bool>,
}

impl CapturingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<EmailMessage> {
        self.messages.lock().clone()
    }

    pub fn set_should_fail(&self, fail: bool) {
        *self.should_fail.lock() = fail;
    }
}

#[async_trait]
impl Mailer for CapturingMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        if *self.should_fail.lock() {
            return Err(Error::sink("mock smtp refused the message"));
        }
        self.messages.lock().push(message.clone());
        Ok(())
    }
}

/// Publisher whose every call fails with a dropped connection.
#[derive(Default)]
pub struct FailingPublisher {
    calls: AtomicU32,
}

impl FailingPublisher {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for FailingPublisher {
    async fn publish(
        &self,
        _destination: &str,
        _message: &Value,
    ) -> std::result::Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::BrokenPipe("mock publisher is down".into()))
    }
}
