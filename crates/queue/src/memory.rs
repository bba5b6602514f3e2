//! Process-local transport for tests and single-process runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::transport::{
    Delivery, Headers, Transport, TransportError, MESSAGE_ID_HEADER, REDELIVERED_HEADER,
};

#[derive(Debug, Clone)]
struct Stored {
    body: Vec<u8>,
    headers: Headers,
}

#[derive(Default)]
struct State {
    queues: BTreeMap<String, VecDeque<Stored>>,
    /// Keyed by delivery id, which increases with every delivery
    in_flight: BTreeMap<u64, (String, Stored)>,
    subscriptions: BTreeSet<String>,
    /// Every message ever sent, per destination
    sent: BTreeMap<String, Vec<Stored>>,
    connected: bool,
    closed: bool,
    connects: u64,
    acked: u64,
    nacked: u64,
    next_id: u64,
    // fault injection
    fail_connects: u32,
    fail_sends: u32,
    fail_acks: u32,
    drop_on_receive: u32,
}

/// Queues keyed by destination, with in-flight tracking and redelivery on
/// nack.
///
/// Like a broker session, a disconnect returns every unsettled delivery to
/// the front of its queue marked as redelivered. Settling one of those
/// deliveries afterwards is a protocol error.
#[derive(Default)]
pub struct InMemoryTransport {
    state: Mutex<State>,
    arrivals: Notify,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a JSON message without going through a connection.
    pub fn publish_json(&self, destination: &str, body: &Value) {
        self.publish_raw(destination, body.to_string().into_bytes());
    }

    /// Enqueue arbitrary bytes without going through a connection.
    pub fn publish_raw(&self, destination: &str, body: Vec<u8>) {
        let mut state = self.state.lock();
        let stored = Stored {
            body,
            headers: Headers::new(),
        };
        state.queues.entry(destination.to_string()).or_default().push_back(stored);
        drop(state);
        self.arrivals.notify_waiters();
    }

    /// Bodies of every message sent to `destination`, parsed as JSON.
    pub fn sent_json(&self, destination: &str) -> Vec<Value> {
        let state = self.state.lock();
        state
            .sent
            .get(destination)
            .map(|msgs| {
                msgs.iter()
                    .filter_map(|m| serde_json::from_slice(&m.body).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Messages waiting on `destination` (not yet delivered).
    pub fn pending(&self, destination: &str) -> usize {
        self.state.lock().queues.get(destination).map_or(0, VecDeque::len)
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn acked(&self) -> u64 {
        self.state.lock().acked
    }

    pub fn nacked(&self) -> u64 {
        self.state.lock().nacked
    }

    pub fn connects(&self) -> u64 {
        self.state.lock().connects
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().fail_connects = n;
    }

    /// Drop the connection on the next `n` sends.
    pub fn fail_next_sends(&self, n: u32) {
        self.state.lock().fail_sends = n;
    }

    /// Drop the connection on the next `n` acks or nacks.
    pub fn fail_next_acks(&self, n: u32) {
        self.state.lock().fail_acks = n;
    }

    /// Drop the connection on the next `n` receive calls.
    pub fn drop_next_receives(&self, n: u32) {
        self.state.lock().drop_on_receive = n;
    }

    /// Shut the transport down. Blocked receivers return `Closed`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.arrivals.notify_waiters();
    }

    /// Shared guard for every connected operation.
    fn check(state: &State) -> Result<(), TransportError> {
        if state.closed {
            Err(TransportError::Closed)
        } else if !state.connected {
            Err(TransportError::NotConnected)
        } else {
            Ok(())
        }
    }

    fn take_fault(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }

    fn try_take(&self, destination: &str) -> Result<Option<Delivery>, TransportError> {
        let mut state = self.state.lock();
        Self::check(&state)?;

        if Self::take_fault(&mut state.drop_on_receive) {
            state.connected = false;
            return Err(TransportError::BrokenPipe("connection reset during receive".into()));
        }

        if !state.subscriptions.contains(destination) {
            return Err(TransportError::Protocol(format!("not subscribed to {destination}")));
        }

        let Some(stored) = state.queues.get_mut(destination).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };

        state.next_id += 1;
        let id = state.next_id;
        state.in_flight.insert(id, (destination.to_string(), stored.clone()));

        Ok(Some(Delivery {
            id: id.to_string(),
            destination: destination.to_string(),
            body: stored.body,
            headers: stored.headers,
        }))
    }

    fn requeue(state: &mut State, destination: String, mut stored: Stored) {
        stored
            .headers
            .insert(REDELIVERED_HEADER.to_string(), "true".to_string());
        state.queues.entry(destination).or_default().push_front(stored);
    }

    fn settle(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check(&state)?;

        if Self::take_fault(&mut state.fail_acks) {
            state.connected = false;
            return Err(TransportError::BrokenPipe("connection reset during ack".into()));
        }

        let (destination, stored) = delivery
            .id
            .parse::<u64>()
            .ok()
            .and_then(|id| state.in_flight.remove(&id))
            .ok_or_else(|| TransportError::Protocol(format!("unknown delivery {}", delivery.id)))?;

        if requeue {
            state.nacked += 1;
            Self::requeue(&mut state, destination, stored);
        } else {
            state.acked += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self, heartbeat: Duration) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if Self::take_fault(&mut state.fail_connects) {
            return Err(TransportError::NotConnected);
        }
        state.connected = true;
        state.connects += 1;
        debug!(heartbeat_ms = %heartbeat.as_millis(), connects = state.connects, "In-memory transport connected");
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.subscriptions.clear();

        // Newest first, so each queue keeps its original delivery order.
        let unsettled = std::mem::take(&mut state.in_flight);
        let requeued = unsettled.len();
        for (_, (destination, stored)) in unsettled.into_iter().rev() {
            Self::requeue(&mut state, destination, stored);
        }
        drop(state);

        if requeued > 0 {
            debug!(requeued, "Returned unsettled deliveries on disconnect");
            self.arrivals.notify_waiters();
        }
    }

    async fn subscribe(&self, destination: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check(&state)?;
        state.subscriptions.insert(destination.to_string());
        Ok(())
    }

    async fn receive(
        &self,
        destination: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, TransportError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Register interest before checking so a publish in between is not missed.
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            if let Some(delivery) = self.try_take(destination)? {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, arrival).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.settle(delivery, false)
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.settle(delivery, true)?;
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn send(
        &self,
        destination: &str,
        body: &[u8],
        headers: &Headers,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check(&state)?;

        if Self::take_fault(&mut state.fail_sends) {
            state.connected = false;
            return Err(TransportError::BrokenPipe("connection reset during send".into()));
        }

        let mut headers = headers.clone();
        headers
            .entry(MESSAGE_ID_HEADER.to_string())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string());

        let stored = Stored {
            body: body.to_vec(),
            headers,
        };
        state.sent.entry(destination.to_string()).or_default().push(stored.clone());
        state.queues.entry(destination.to_string()).or_default().push_back(stored);
        drop(state);

        self.arrivals.notify_waiters();
        Ok(())
    }
}
