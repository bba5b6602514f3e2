//! Redpanda (Kafka-compatible) transport using rskafka.
//!
//! Each destination is a topic read from partition 0. Acknowledgment is
//! tracked per topic as a committed offset:
//! - ack advances the committed offset past the delivered record
//! - nack rewinds the read position to the delivered record, so the next
//!   receive returns it again with the `redelivered` header set
//! - only one record per topic is handed out at a time
//!
//! Every ack also persists the committed offset to an [`OffsetStore`]. A new
//! subscription resumes from the stored offset, falling back to the
//! configured start only for topics with nothing committed.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rskafka::client::{
    partition::{Compression, OffsetAt, PartitionClient, UnknownTopicHandling},
    Client, ClientBuilder, Credentials, SaslConfig,
};
use rskafka::record::{Record, RecordAndOffset};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{QueueConfig, StartOffset};
use crate::offsets::{FileOffsetStore, MemoryOffsetStore, OffsetStore};
use crate::transport::{
    Delivery, Headers, Transport, TransportError, MESSAGE_ID_HEADER, REDELIVERED_HEADER,
};

/// Creates a TLS configuration for managed clusters.
fn create_tls_config() -> Arc<rustls::ClientConfig> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Arc::new(config)
}

/// Client builder with TLS and SASL applied when credentials are configured.
pub(crate) fn client_builder(config: &QueueConfig) -> ClientBuilder {
    let mut builder = ClientBuilder::new(vec![config.broker_string()]);

    if let Some((username, password)) = config.sasl_credentials() {
        builder = builder
            .tls_config(create_tls_config())
            .sasl_config(SaslConfig::ScramSha256(Credentials::new(
                username.to_string(),
                password.to_string(),
            )));
    }

    builder
}

/// Classify an rskafka error by whether reconnecting can help.
pub(crate) fn map_kafka_error(context: &str, e: rskafka::client::error::Error) -> TransportError {
    use rskafka::client::error::Error as KafkaError;

    match e {
        KafkaError::Connection(_) | KafkaError::Request(_) => {
            TransportError::BrokenPipe(format!("{context}: {e}"))
        }
        other => TransportError::Protocol(format!("{context}: {other}")),
    }
}

/// Where to resume a topic with a committed offset. Records below the
/// earliest retained offset are gone, so resume from there instead.
fn resume_offset(topic: &str, committed: i64, earliest: i64) -> i64 {
    if committed < earliest {
        warn!(topic, committed, earliest, "Committed offset no longer retained, resuming at earliest");
        earliest
    } else {
        committed
    }
}

#[derive(Debug, Default)]
struct Cursor {
    /// Next offset to hand out
    next: i64,
    /// Everything below this has been acked
    committed: i64,
    /// Highest offset handed out so far, plus one
    high_water: i64,
    buffered: VecDeque<RecordAndOffset>,
}

/// Transport over a Redpanda cluster.
pub struct RedpandaTransport {
    config: QueueConfig,
    client: RwLock<Option<Arc<Client>>>,
    partitions: RwLock<BTreeMap<String, Arc<PartitionClient>>>,
    cursors: Mutex<BTreeMap<String, Cursor>>,
    subscriptions: Mutex<BTreeSet<String>>,
    offsets: Arc<dyn OffsetStore>,
}

impl RedpandaTransport {
    /// Transport with offsets persisted to `config.offsets_path`, or kept in
    /// memory when no path is set.
    pub fn new(config: QueueConfig) -> Self {
        let offsets: Arc<dyn OffsetStore> = match &config.offsets_path {
            Some(path) => Arc::new(FileOffsetStore::new(path)),
            None => {
                warn!("No offsets path configured; a restart replays from the start offset");
                Arc::new(MemoryOffsetStore::new())
            }
        };
        Self::with_offset_store(config, offsets)
    }

    pub fn with_offset_store(config: QueueConfig, offsets: Arc<dyn OffsetStore>) -> Self {
        info!(brokers = %config.broker_string(), tls = config.sasl_credentials().is_some(), "Creating Redpanda transport");
        Self {
            config,
            client: RwLock::new(None),
            partitions: RwLock::new(BTreeMap::new()),
            cursors: Mutex::new(BTreeMap::new()),
            subscriptions: Mutex::new(BTreeSet::new()),
            offsets,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Committed offset for `destination`, if subscribed.
    pub fn committed_offset(&self, destination: &str) -> Option<i64> {
        self.cursors.lock().get(destination).map(|c| c.committed)
    }

    async fn partition(&self, topic: &str) -> Result<Arc<PartitionClient>, TransportError> {
        {
            let partitions = self.partitions.read().await;
            if let Some(p) = partitions.get(topic) {
                return Ok(p.clone());
            }
        }

        let client = self
            .client
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;

        let partition = client
            .partition_client(topic.to_string(), 0, UnknownTopicHandling::Error)
            .await
            .map_err(|e| map_kafka_error(&format!("partition client for {topic}"), e))?;
        let partition = Arc::new(partition);

        self.partitions
            .write()
            .await
            .insert(topic.to_string(), partition.clone());
        Ok(partition)
    }

    async fn broker_offset(
        &self,
        partition: &PartitionClient,
        at: OffsetAt,
    ) -> Result<i64, TransportError> {
        match partition.get_offset(at).await {
            Ok(offset) => Ok(offset),
            Err(e) => {
                let err = map_kafka_error("failed to get offset", e);
                self.drop_connection(&err).await;
                Err(err)
            }
        }
    }

    /// First offset a new subscription to `destination` reads.
    async fn start_offset(
        &self,
        destination: &str,
        partition: &PartitionClient,
    ) -> Result<i64, TransportError> {
        let committed = self.offsets.load(destination).await?;
        let earliest = self.broker_offset(partition, OffsetAt::Earliest).await?;

        match (committed, self.config.start_offset) {
            (Some(committed), _) => Ok(resume_offset(destination, committed, earliest)),
            (None, StartOffset::Earliest) => Ok(earliest),
            (None, StartOffset::Latest) => self.broker_offset(partition, OffsetAt::Latest).await,
        }
    }

    /// Forget the connection after a connection-level error.
    async fn drop_connection(&self, err: &TransportError) {
        if err.is_connection() {
            warn!(error = %err, "Redpanda connection lost");
            self.disconnect().await;
        }
    }

    fn parse_offset(delivery: &Delivery) -> Result<i64, TransportError> {
        delivery
            .id
            .parse()
            .map_err(|_| TransportError::Protocol(format!("invalid delivery id {}", delivery.id)))
    }

    fn take_buffered(&self, topic: &str) -> Option<Delivery> {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.get_mut(topic)?;

        while let Some(record) = cursor.buffered.pop_front() {
            // Batches may start before the requested offset.
            if record.offset < cursor.next {
                continue;
            }

            let offset = record.offset;
            let redelivered = offset < cursor.high_water;
            cursor.next = offset + 1;
            cursor.high_water = cursor.high_water.max(offset + 1);

            let mut headers: Headers = record
                .record
                .headers
                .into_iter()
                .map(|(k, v)| (k, String::from_utf8_lossy(&v).into_owned()))
                .collect();
            if redelivered {
                headers.insert(REDELIVERED_HEADER.to_string(), "true".to_string());
            }

            return Some(Delivery {
                id: offset.to_string(),
                destination: topic.to_string(),
                body: record.record.value.unwrap_or_default(),
                headers,
            });
        }
        None
    }
}

#[async_trait]
impl Transport for RedpandaTransport {
    async fn connect(&self, heartbeat: Duration) -> Result<(), TransportError> {
        // Kafka sessions are kept alive by the client; the interval is logged only.
        let client = client_builder(&self.config)
            .build()
            .await
            .map_err(|e| TransportError::BrokenPipe(format!("failed to connect to Redpanda: {e}")))?;

        *self.client.write().await = Some(Arc::new(client));
        self.partitions.write().await.clear();

        info!(brokers = %self.config.broker_string(), heartbeat_ms = %heartbeat.as_millis(), "Connected to Redpanda");
        Ok(())
    }

    async fn disconnect(&self) {
        *self.client.write().await = None;
        self.partitions.write().await.clear();
        self.subscriptions.lock().clear();

        // Unread buffered records are fetched again after reconnecting.
        let mut cursors = self.cursors.lock();
        for cursor in cursors.values_mut() {
            if let Some(first) = cursor.buffered.front() {
                cursor.next = cursor.next.min(first.offset);
            }
            cursor.buffered.clear();
        }
    }

    async fn subscribe(&self, destination: &str) -> Result<(), TransportError> {
        let partition = self.partition(destination).await?;

        let has_cursor = self.cursors.lock().contains_key(destination);
        if !has_cursor {
            let offset = self.start_offset(destination, &partition).await?;

            self.cursors.lock().insert(
                destination.to_string(),
                Cursor {
                    next: offset,
                    committed: offset,
                    high_water: offset,
                    buffered: VecDeque::new(),
                },
            );
            info!(topic = %destination, partition = 0, offset, "Subscription initialized at offset");
        }

        self.subscriptions.lock().insert(destination.to_string());
        Ok(())
    }

    async fn receive(
        &self,
        destination: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, TransportError> {
        let subscribed = self.subscriptions.lock().contains(destination);
        if !subscribed {
            return if self.client.read().await.is_none() {
                Err(TransportError::NotConnected)
            } else {
                Err(TransportError::Protocol(format!("not subscribed to {destination}")))
            };
        }

        if let Some(delivery) = self.take_buffered(destination) {
            return Ok(Some(delivery));
        }

        let partition = self.partition(destination).await?;
        let next = self
            .cursors
            .lock()
            .get(destination)
            .map(|c| c.next)
            .unwrap_or_default();

        let max_wait_ms = i32::try_from(wait.as_millis()).unwrap_or(i32::MAX);
        let (records, watermark) = match partition
            .fetch_records(next, 1..self.config.max_fetch_bytes, max_wait_ms)
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                let err = map_kafka_error("failed to fetch records", e);
                self.drop_connection(&err).await;
                return Err(err);
            }
        };

        debug!(topic = %destination, offset = next, records = records.len(), watermark, "Fetched records");

        if records.is_empty() {
            return Ok(None);
        }
        if let Some(cursor) = self.cursors.lock().get_mut(destination) {
            cursor.buffered.extend(records);
        }
        Ok(self.take_buffered(destination))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let offset = Self::parse_offset(delivery)?;
        let advanced = {
            let mut cursors = self.cursors.lock();
            let cursor = cursors.get_mut(&delivery.destination).ok_or_else(|| {
                TransportError::Protocol(format!("no cursor for {}", delivery.destination))
            })?;

            let before = cursor.committed;
            cursor.committed = cursor.committed.max(offset + 1);
            (cursor.committed > before).then_some(cursor.committed)
        };

        if let Some(committed) = advanced {
            self.offsets.store(&delivery.destination, committed).await?;
            debug!(topic = %delivery.destination, committed, "Committed offset");
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let offset = Self::parse_offset(delivery)?;
        let mut cursors = self.cursors.lock();
        let cursor = cursors
            .get_mut(&delivery.destination)
            .ok_or_else(|| TransportError::Protocol(format!("no cursor for {}", delivery.destination)))?;

        cursor.next = offset;
        cursor.buffered.clear();
        debug!(topic = %delivery.destination, offset, "Rewound for redelivery");
        Ok(())
    }

    async fn send(
        &self,
        destination: &str,
        body: &[u8],
        headers: &Headers,
    ) -> Result<(), TransportError> {
        let partition = self.partition(destination).await?;

        let mut record_headers: BTreeMap<String, Vec<u8>> = headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().into_bytes()))
            .collect();
        record_headers
            .entry(MESSAGE_ID_HEADER.to_string())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string().into_bytes());

        let record = Record {
            key: None,
            value: Some(body.to_vec()),
            headers: record_headers,
            timestamp: Utc::now(),
        };

        match partition.produce(vec![record], Compression::NoCompression).await {
            Ok(offsets) => {
                debug!(topic = %destination, offsets = ?offsets, "Produced record");
                Ok(())
            }
            Err(e) => {
                let err = map_kafka_error(&format!("failed to produce to {destination}"), e);
                self.drop_connection(&err).await;
                Err(err)
            }
        }
    }
}
