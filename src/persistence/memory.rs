//! In-memory event store and archive sink, for tests and local
//! experimentation (§A "ships one in-memory implementation of the store
//! and bus").

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Notify;
use tokio::time::timeout as tokio_timeout;

use super::store::{AggregateKey, ArchiveRecord, ArchiveSink, EventStore, StoreError, StoredEvent};

struct Stream {
    events: Vec<(u64, serde_json::Value)>,
}

impl Stream {
    fn new() -> Self {
        Self { events: Vec::new() }
    }
}

/// In-memory implementation of [`EventStore`] and [`ArchiveSink`]. Stores
/// events as raw JSON so one struct can back any aggregate's event type.
pub struct InMemoryEventStore {
    streams: RwLock<BTreeMap<AggregateKey, Stream>>,
    archive_queue: RwLock<VecDeque<ArchiveRecord>>,
    archive_notify: Notify,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(BTreeMap::new()),
            archive_queue: RwLock::new(VecDeque::new()),
            archive_notify: Notify::new(),
        }
    }

    pub fn stream_len(&self, key: &AggregateKey) -> u64 {
        self.streams
            .read()
            .get(key)
            .map(|s| s.events.len() as u64)
            .unwrap_or(0)
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E> EventStore<E> for InMemoryEventStore
where
    E: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn append(
        &self,
        key: &AggregateKey,
        expected_version: u64,
        events: Vec<E>,
    ) -> Result<u64, StoreError> {
        let mut streams = self.streams.write();
        let stream = streams.entry(key.clone()).or_insert_with(Stream::new);
        let current_version = stream.events.len() as u64;
        if current_version != expected_version {
            return Err(StoreError::ConcurrencyConflict {
                key: key.clone(),
                expected: expected_version,
                actual: current_version,
            });
        }
        for event in events {
            let value = serde_json::to_value(&event)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let seq = stream.events.len() as u64 + 1;
            stream.events.push((seq, value));
        }
        Ok(stream.events.len() as u64)
    }

    async fn load(&self, key: &AggregateKey) -> Result<(Vec<StoredEvent<E>>, u64), StoreError> {
        let streams = self.streams.read();
        let Some(stream) = streams.get(key) else {
            return Ok((Vec::new(), 0));
        };
        let mut out = Vec::with_capacity(stream.events.len());
        for (seq, value) in &stream.events {
            let data: E = serde_json::from_value(value.clone())
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            out.push(StoredEvent {
                sequence: *seq,
                timestamp: Utc::now(),
                data,
            });
        }
        let version = stream.events.len() as u64;
        Ok((out, version))
    }

    async fn snapshot(
        &self,
        _key: &AggregateKey,
        _sequence: u64,
        _state: serde_json::Value,
    ) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl ArchiveSink for InMemoryEventStore {
    async fn submit(&self, record: ArchiveRecord) -> Result<(), StoreError> {
        self.archive_queue.write().push_back(record);
        self.archive_notify.notify_one();
        Ok(())
    }

    async fn poll_archive(&self, timeout: Duration) -> Result<Option<ArchiveRecord>, StoreError> {
        if let Some(record) = self.archive_queue.write().pop_front() {
            return Ok(Some(record));
        }
        let _ = tokio_timeout(timeout, self.archive_notify.notified()).await;
        Ok(self.archive_queue.write().pop_front())
    }
}
