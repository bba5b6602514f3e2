//! Queue client: connection lifecycle, settle-with-retry, subscribe loop.
//!
//! Connection states move `Disconnected -> Connecting -> Connected` and
//! back to `Disconnected` on any connection-level error. `send`, `ack` and
//! `nack` retry up to `transport_retries` times on such errors, forcing a
//! reconnect before each retry. The subscribe loop never propagates a
//! handler failure; it settles every delivery synchronously before asking
//! for the next one.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info, info_span, warn, Instrument};

use ingest_core::DeadLetterMessage;
use telemetry::{health, metrics};

use crate::config::QueueConfig;
use crate::handler::{disposition, Disposition, HandlerOutcome, MessageHandler};
use crate::transport::{Delivery, Headers, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Broker client over a [`Transport`].
pub struct QueueClient<T> {
    transport: T,
    config: QueueConfig,
    state: Mutex<ConnectionState>,
    /// Bumped on every successful connect; subscriptions are renewed when
    /// it changes.
    epoch: AtomicU64,
    closing: AtomicBool,
}

impl<T: Transport> QueueClient<T> {
    pub fn new(transport: T, config: QueueConfig) -> Self {
        Self {
            transport,
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            epoch: AtomicU64::new(0),
            closing: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Ask the subscribe loop to stop after the current delivery.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub async fn connect(&self) -> Result<(), TransportError> {
        self.set_state(ConnectionState::Connecting);
        match self.transport.connect(self.config.heartbeat()).await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                self.epoch.fetch_add(1, Ordering::SeqCst);
                health().broker.set_healthy();
                debug!(heartbeat_ms = self.config.heartbeat_ms, "Queue client connected");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                health().broker.set_unhealthy(e.to_string());
                Err(e)
            }
        }
    }

    async fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.connect().await
    }

    /// Tear down and re-open the connection.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        self.transport.disconnect().await;
        self.set_state(ConnectionState::Disconnected);
        metrics().reconnects.inc();
        info!("Reconnecting to broker");
        self.connect().await
    }

    fn mark_disconnected(&self, err: &TransportError) {
        self.set_state(ConnectionState::Disconnected);
        health().broker.set_unhealthy(err.to_string());
    }

    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Run `op`, reconnecting and retrying on connection-level errors.
    async fn with_retry<R, F, Fut>(&self, op_name: &str, mut op: F) -> Result<R, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        let mut retries = 0u32;
        let mut result = self.ensure_connected().await;

        loop {
            let err = match result {
                Ok(()) => match op().await {
                    Ok(value) => return Ok(value),
                    Err(e) => e,
                },
                Err(e) => e,
            };

            if !err.is_connection() || retries >= self.config.transport_retries {
                return Err(err);
            }

            retries += 1;
            warn!(op = op_name, retries, error = %err, "Transport error, reconnecting before retry");
            self.mark_disconnected(&err);
            result = self.reconnect().await;
        }
    }

    pub async fn send(
        &self,
        destination: &str,
        body: &[u8],
        headers: &Headers,
    ) -> Result<(), TransportError> {
        self.with_retry("send", || self.transport.send(destination, body, headers))
            .await
    }

    pub async fn send_json<M: Serialize>(
        &self,
        destination: &str,
        message: &M,
    ) -> Result<(), TransportError> {
        let body = serde_json::to_vec(message)
            .map_err(|e| TransportError::Protocol(format!("failed to encode message: {e}")))?;
        self.send(destination, &body, &Headers::new()).await
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.with_retry("ack", || self.transport.ack(delivery)).await?;
        metrics().messages_acked.inc();
        Ok(())
    }

    pub async fn nack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.with_retry("nack", || self.transport.nack(delivery)).await?;
        metrics().messages_nacked.inc();
        Ok(())
    }

    /// Receive from `destination` and hand each delivery to `handler` until
    /// the transport closes or [`close`](Self::close) is called.
    ///
    /// Connection errors while receiving are followed by a fixed delay and
    /// a reconnect; they never end the loop.
    pub async fn subscribe<H>(&self, destination: &str, handler: &H) -> Result<(), TransportError>
    where
        H: MessageHandler + ?Sized,
    {
        info!(destination, dlq_on_error = self.config.dlq_on_error, "Subscribing");
        let mut subscribed_epoch = None;

        while !self.is_closing() {
            if let Err(e) = self.ensure_connected().await {
                if e == TransportError::Closed {
                    break;
                }
                warn!(error = %e, delay_ms = self.config.reconnect_delay_ms, "Broker unavailable, retrying");
                tokio::time::sleep(self.config.reconnect_delay()).await;
                continue;
            }

            let epoch = self.epoch.load(Ordering::SeqCst);
            if subscribed_epoch != Some(epoch) {
                match self.transport.subscribe(destination).await {
                    Ok(()) => subscribed_epoch = Some(epoch),
                    Err(TransportError::Closed) => break,
                    Err(e) => {
                        self.recover(&e).await;
                        continue;
                    }
                }
            }

            match self
                .transport
                .receive(destination, self.config.poll_interval())
                .await
            {
                Ok(Some(delivery)) => match self.process(&delivery, handler).await {
                    Err(TransportError::Closed) => break,
                    Err(e) if e.is_connection() => self.recover(&e).await,
                    _ => {}
                },
                Ok(None) => {}
                Err(TransportError::Closed) => break,
                Err(e) => self.recover(&e).await,
            }
        }

        info!(destination, "Subscribe loop stopped");
        Ok(())
    }

    /// After a failed receive: mark the connection down and wait before the
    /// next attempt.
    async fn recover(&self, err: &TransportError) {
        if err.is_connection() {
            warn!(error = %err, delay_ms = self.config.reconnect_delay_ms, "Unexpected disconnect");
            self.mark_disconnected(err);
            self.transport.disconnect().await;
            metrics().reconnects.inc();
        } else {
            error!(error = %err, "Broker protocol error");
        }
        tokio::time::sleep(self.config.reconnect_delay()).await;
    }

    /// Run the handler for one delivery and settle it.
    async fn process<H>(&self, delivery: &Delivery, handler: &H) -> Result<(), TransportError>
    where
        H: MessageHandler + ?Sized,
    {
        metrics().messages_received.inc();
        let body = decode_body(&delivery.body);

        let span = info_span!("delivery", id = %delivery.id, redelivered = delivery.is_redelivery());
        let outcome = handler.handle(&body, &delivery.headers).instrument(span).await;

        let result = match disposition(&outcome, self.config.dlq_on_error) {
            Disposition::Ack => self.ack(delivery).await,
            Disposition::DeadLetter(error) => self.dead_letter(delivery, body, error).await,
            Disposition::Nack(error) => {
                warn!(id = %delivery.id, %error, "Handler failed, nacking for redelivery");
                self.nack(delivery).await
            }
        };

        if let Err(e) = &result {
            error!(id = %delivery.id, outcome = outcome.label(), error = %e, "Failed to settle delivery");
        }
        result
    }

    /// Publish to the dead-letter destination, then ack the original.
    ///
    /// If the dead-letter publish fails the delivery is nacked instead, so
    /// the message is never lost.
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        body: Value,
        error: String,
    ) -> Result<(), TransportError> {
        let message = DeadLetterMessage {
            original_body: body,
            headers: delivery.headers.clone(),
            error,
        };

        match self.send_json(&self.config.dlq_destination, &message).await {
            Ok(()) => {
                metrics().messages_dead_lettered.inc();
                warn!(id = %delivery.id, dlq = %self.config.dlq_destination, error = %message.error, "Dead-lettered delivery");
                self.ack(delivery).await
            }
            Err(TransportError::Closed) => Err(TransportError::Closed),
            Err(e) => {
                error!(id = %delivery.id, error = %e, "Dead-letter publish failed, nacking");
                self.nack(delivery).await
            }
        }
    }
}

/// Parse a delivery body as JSON; anything else is wrapped as
/// `{"raw": <text>}` so the handler still sees it.
pub fn decode_body(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| json!({ "raw": String::from_utf8_lossy(body) }))
}

/// Outcome wrapper for handlers written as plain results.
pub fn outcome_from_result<E: std::fmt::Display>(
    result: Result<(), E>,
    retryable: impl FnOnce(&E) -> bool,
) -> HandlerOutcome {
    match result {
        Ok(()) => HandlerOutcome::Success,
        Err(e) if retryable(&e) => HandlerOutcome::RetryableFailure(e.to_string()),
        Err(e) => HandlerOutcome::TerminalFailure(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryTransport;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    const JOBS: &str = "police.fetch";
    const DLQ: &str = "police.dlq";

    fn config(dlq_on_error: bool) -> QueueConfig {
        QueueConfig {
            dlq_on_error,
            reconnect_delay_ms: 1,
            poll_interval_ms: 5,
            ..Default::default()
        }
    }

    /// Records bodies; fails every call while `fail` is set.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Value>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, body: &Value, _headers: &Headers) -> HandlerOutcome {
            self.seen.lock().push(body.clone());
            if self.fail.load(Ordering::SeqCst) {
                HandlerOutcome::TerminalFailure("boom".into())
            } else {
                HandlerOutcome::Success
            }
        }
    }

    /// Run the subscribe loop until `done` holds, then close it.
    async fn run_until(
        client: Arc<QueueClient<InMemoryTransport>>,
        handler: Arc<Recorder>,
        done: impl Fn(&QueueClient<InMemoryTransport>, &Recorder) -> bool,
    ) {
        let loop_client = client.clone();
        let loop_handler = handler.clone();
        let task = tokio::spawn(async move { loop_client.subscribe(JOBS, loop_handler.as_ref()).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while !done(&client, &handler) {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached");

        client.close();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_success_acks() {
        let transport = InMemoryTransport::new();
        transport.publish_json(JOBS, &json!({"force": "metropolitan", "month": "2024-05"}));
        let client = Arc::new(QueueClient::new(transport, config(true)));
        let handler = Arc::new(Recorder::default());

        run_until(client.clone(), handler.clone(), |c, _| c.transport().acked() == 1).await;

        assert_eq!(handler.seen.lock().len(), 1);
        assert_eq!(client.transport().in_flight(), 0);
        assert!(client.transport().sent_json(DLQ).is_empty());
    }

    #[tokio::test]
    async fn test_failure_dead_letters_once_and_acks() {
        let transport = InMemoryTransport::new();
        transport.publish_json(JOBS, &json!({"force": "metropolitan", "month": "2024-05"}));
        transport.publish_json(JOBS, &json!({"force": "kent", "month": "2024-05"}));
        let client = Arc::new(QueueClient::new(transport, config(true)));
        let handler = Arc::new(Recorder::default());
        handler.fail.store(true, Ordering::SeqCst);

        run_until(client.clone(), handler.clone(), |c, _| c.transport().acked() == 2).await;

        let dead = client.transport().sent_json(DLQ);
        assert_eq!(dead.len(), 2);
        assert_eq!(dead[0]["original_body"]["force"], "metropolitan");
        assert_eq!(dead[0]["error"], "terminal: boom");
        assert_eq!(client.transport().nacked(), 0);
        assert_eq!(handler.seen.lock().len(), 2);
        assert_eq!(client.transport().pending(JOBS), 0);
    }

    #[tokio::test]
    async fn test_failure_without_dlq_nacks_for_redelivery() {
        let transport = InMemoryTransport::new();
        transport.publish_json(JOBS, &json!({"force": "metropolitan", "month": "2024-05"}));
        let client = Arc::new(QueueClient::new(transport, config(false)));
        let handler = Arc::new(Recorder::default());
        handler.fail.store(true, Ordering::SeqCst);

        // Fails twice, then the handler recovers and the redelivery is acked.
        run_until(client.clone(), handler.clone(), |c, h| {
            if c.transport().nacked() >= 2 {
                h.fail.store(false, Ordering::SeqCst);
            }
            c.transport().acked() == 1
        })
        .await;

        assert!(client.transport().nacked() >= 2);
        assert!(client.transport().sent_json(DLQ).is_empty());
    }

    #[tokio::test]
    async fn test_non_json_body_reaches_handler_as_raw() {
        let transport = InMemoryTransport::new();
        transport.publish_raw(JOBS, b"not json".to_vec());
        let client = Arc::new(QueueClient::new(transport, config(true)));
        let handler = Arc::new(Recorder::default());
        handler.fail.store(true, Ordering::SeqCst);

        run_until(client.clone(), handler.clone(), |c, _| c.transport().acked() == 1).await;

        assert_eq!(handler.seen.lock()[0], json!({"raw": "not json"}));
        let dead = client.transport().sent_json(DLQ);
        assert_eq!(dead[0]["original_body"], json!({"raw": "not json"}));
    }

    #[tokio::test]
    async fn test_receive_disconnect_reconnects_and_resumes() {
        let transport = InMemoryTransport::new();
        transport.publish_json(JOBS, &json!({"force": "metropolitan", "month": "2024-05"}));
        transport.drop_next_receives(2);
        let client = Arc::new(QueueClient::new(transport, config(true)));
        let handler = Arc::new(Recorder::default());

        run_until(client.clone(), handler.clone(), |c, _| c.transport().acked() == 1).await;

        assert_eq!(client.transport().connects(), 3);
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_send_reconnects_then_retries() {
        let transport = InMemoryTransport::new();
        transport.fail_next_sends(2);
        let client = QueueClient::new(transport, config(true));

        client.send_json("police.done", &json!({"status": "ok"})).await.unwrap();
        assert_eq!(client.transport().sent_json("police.done").len(), 1);
        assert_eq!(client.transport().connects(), 3);
    }

    #[tokio::test]
    async fn test_send_gives_up_after_retry_budget() {
        let transport = InMemoryTransport::new();
        transport.fail_next_sends(3);
        let client = QueueClient::new(transport, config(true));

        let err = client.send_json("police.done", &json!({})).await.unwrap_err();
        assert!(err.is_connection());
        assert!(client.transport().sent_json("police.done").is_empty());
    }

    #[tokio::test]
    async fn test_ack_lost_with_connection_is_redelivered() {
        let transport = InMemoryTransport::new();
        transport.publish_json(JOBS, &json!({"force": "metropolitan", "month": "2024-05"}));
        transport.fail_next_acks(1);
        let client = Arc::new(QueueClient::new(transport, config(true)));
        let handler = Arc::new(Recorder::default());

        run_until(client.clone(), handler.clone(), |c, _| c.transport().acked() == 1).await;

        // The reconnect returned the delivery; the retried ack no longer
        // settles it, so it is handled a second time.
        assert_eq!(handler.seen.lock().len(), 2);
        assert_eq!(client.transport().in_flight(), 0);
        assert_eq!(client.transport().pending(JOBS), 0);
    }

    #[tokio::test]
    async fn test_dead_letter_publish_failure_redelivers() {
        let transport = InMemoryTransport::new();
        transport.publish_json(JOBS, &json!({"force": "metropolitan", "month": "2024-05"}));
        // Exhausts the send retry budget for the first dead-letter attempt.
        transport.fail_next_sends(3);
        let client = Arc::new(QueueClient::new(transport, config(true)));
        let handler = Arc::new(Recorder::default());
        handler.fail.store(true, Ordering::SeqCst);

        run_until(client.clone(), handler.clone(), |c, _| c.transport().acked() == 1).await;

        // The reconnects already returned the delivery, so the fallback nack
        // finds nothing to settle.
        assert_eq!(client.transport().nacked(), 0);
        assert_eq!(client.transport().sent_json(DLQ).len(), 1);
        assert_eq!(handler.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_closed_transport_ends_loop() {
        let transport = InMemoryTransport::new();
        transport.close();
        let client = QueueClient::new(transport, config(true));
        let handler = Recorder::default();

        tokio::time::timeout(Duration::from_secs(5), client.subscribe(JOBS, &handler))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: Result<(), String> = Ok(());
        assert_eq!(outcome_from_result(ok, |_| true), HandlerOutcome::Success);
        assert_eq!(
            outcome_from_result(Err("503".to_string()), |e| e == "503"),
            HandlerOutcome::RetryableFailure("503".into())
        );
        assert_eq!(
            outcome_from_result(Err("404".to_string()), |e| e == "503"),
            HandlerOutcome::TerminalFailure("404".into())
        );
    }
}
