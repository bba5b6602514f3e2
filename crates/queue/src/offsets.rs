//! Committed consumer offsets, kept outside the broker.
//!
//! rskafka has no consumer-group support, so the Redpanda transport records
//! the committed offset of each topic here on every ack and resumes from it
//! when a new process subscribes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::transport::TransportError;

#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Offset of the first record not yet acked on `topic`.
    async fn load(&self, topic: &str) -> Result<Option<i64>, TransportError>;

    async fn store(&self, topic: &str, offset: i64) -> Result<(), TransportError>;

    /// Forget `topic`, so the next subscription uses the configured start.
    async fn clear(&self, topic: &str) -> Result<(), TransportError>;
}

/// Offsets that live as long as the process.
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    offsets: Mutex<BTreeMap<String, i64>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn load(&self, topic: &str) -> Result<Option<i64>, TransportError> {
        Ok(self.offsets.lock().get(topic).copied())
    }

    async fn store(&self, topic: &str, offset: i64) -> Result<(), TransportError> {
        self.offsets.lock().insert(topic.to_string(), offset);
        Ok(())
    }

    async fn clear(&self, topic: &str) -> Result<(), TransportError> {
        self.offsets.lock().remove(topic);
        Ok(())
    }
}

/// Offsets in a JSON file (`{"topic": offset}`).
///
/// Every store rewrites the file through a temporary sibling and a rename,
/// so a crash leaves either the old or the new map on disk.
pub struct FileOffsetStore {
    path: PathBuf,
    // Loaded on first use
    cache: tokio::sync::Mutex<Option<BTreeMap<String, i64>>>,
}

fn io_error(path: &Path, e: impl std::fmt::Display) -> TransportError {
    TransportError::Offsets(format!("{}: {e}", path.display()))
}

impl FileOffsetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<BTreeMap<String, i64>, TransportError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| io_error(&self.path, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(io_error(&self.path, e)),
        }
    }

    async fn write_file(&self, offsets: &BTreeMap<String, i64>) -> Result<(), TransportError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_error(dir, e))?;
        }

        let body = serde_json::to_vec_pretty(offsets).map_err(|e| io_error(&self.path, e))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_error(&self.path, e))
    }

    /// Apply `update` to the map and persist it.
    async fn modify(
        &self,
        update: impl FnOnce(&mut BTreeMap<String, i64>),
    ) -> Result<(), TransportError> {
        let mut cache = self.cache.lock().await;
        let mut offsets = match cache.take() {
            Some(offsets) => offsets,
            None => self.read_file().await?,
        };
        update(&mut offsets);

        let written = self.write_file(&offsets).await;
        *cache = Some(offsets);
        written
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn load(&self, topic: &str) -> Result<Option<i64>, TransportError> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.read_file().await?);
        }
        Ok(cache.as_ref().and_then(|offsets| offsets.get(topic).copied()))
    }

    async fn store(&self, topic: &str, offset: i64) -> Result<(), TransportError> {
        self.modify(|offsets| {
            offsets.insert(topic.to_string(), offset);
        })
        .await?;
        debug!(topic, offset, path = %self.path.display(), "Persisted committed offset");
        Ok(())
    }

    async fn clear(&self, topic: &str) -> Result<(), TransportError> {
        self.modify(|offsets| {
            offsets.remove(topic);
        })
        .await
    }
}
