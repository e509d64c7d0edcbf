//! Event store contract consumed by the [`crate::executor::EventExecutor`]
//! (§6 "Event store contract (consumed)").

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

/// Structured composite key identifying one aggregate stream (§6 "Keys
/// are structured IDs").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AggregateKey {
    Engine,
    Flow(String),
}

impl std::fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Engine => write!(f, "engine"),
            Self::Flow(id) => write!(f, "flow:{id}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("aggregate not found: {0}")]
    NotFound(AggregateKey),

    #[error("concurrency conflict on {key}: expected version {expected}, got {actual}")]
    ConcurrencyConflict {
        key: AggregateKey,
        expected: u64,
        actual: u64,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// One archived flow's full event-sourced history, handed off to the
/// external archiver (§6 "Archival contract").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub stream_id: String,
    pub aggregate_id: String,
    pub snapshot_sequence: u64,
    pub snapshot_data: serde_json::Value,
    pub events: Vec<serde_json::Value>,
}

/// A raw event as persisted: its position in the stream plus the typed
/// payload.
#[derive(Debug, Clone)]
pub struct StoredEvent<E> {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub data: E,
}

/// Append-only event store with optimistic concurrency, generic over one
/// aggregate's event type. A single concrete store type may implement
/// this trait for both `FlowEvent` and `EngineEvent` (two aggregates, one
/// backing store), matching §2's ownership split.
#[async_trait]
pub trait EventStore<E>: Send + Sync + 'static
where
    E: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Appends `events` at `expected_version`, returning the new version.
    /// Fails with `ConcurrencyConflict` if another writer already
    /// advanced the stream past `expected_version`.
    async fn append(
        &self,
        key: &AggregateKey,
        expected_version: u64,
        events: Vec<E>,
    ) -> Result<u64, StoreError>;

    /// Loads every event recorded for `key` plus the current version, in
    /// sequence order. An unknown key loads as an empty stream at
    /// version 0, not an error — a flow's first `Append` creates it.
    async fn load(&self, key: &AggregateKey) -> Result<(Vec<StoredEvent<E>>, u64), StoreError>;

    /// Records a point-in-time snapshot for recovery acceleration. Pure
    /// bookkeeping: `load` always replays the full event log in this
    /// crate's in-memory implementation.
    async fn snapshot(
        &self,
        key: &AggregateKey,
        sequence: u64,
        state: serde_json::Value,
    ) -> Result<(), StoreError>;
}

/// Sink for completed-flow archive hand-off (§6 "Archival contract"),
/// polled by the external archiver.
#[async_trait]
pub trait ArchiveSink: Send + Sync + 'static {
    async fn submit(&self, record: ArchiveRecord) -> Result<(), StoreError>;

    /// Blocks up to `timeout` for the next archive record, or returns
    /// `None` if none arrives in time.
    async fn poll_archive(&self, timeout: Duration) -> Result<Option<ArchiveRecord>, StoreError>;
}
