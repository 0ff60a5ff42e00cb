//! Durable ordered change log.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, RwLock};
use trellis_core::{
    EventAttachment, EventId, EventMeta, EventSpec, TrellisError, TrellisResult,
};
use trellis_storage::DurableStore;

/// Read side of the durable change log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Events with id greater than `after`, ascending, at most `limit` of them.
    async fn list_events(&self, after: EventId, limit: usize) -> TrellisResult<Vec<EventMeta>>;

    /// Id of the newest event in the log, or 0 when the log is empty.
    ///
    /// Observers start from this cursor rather than replaying history.
    async fn cursor_reminder(&self) -> TrellisResult<EventId>;
}

/// Append-only in-memory change log.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    events: RwLock<Vec<EventMeta>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, assigning the next id.
    pub fn append(&self, spec: EventSpec, attachment: EventAttachment) -> TrellisResult<EventMeta> {
        let mut events = self
            .events
            .write()
            .map_err(|_| TrellisError::poisoned("event-log"))?;
        let id = events.last().map(|e| e.id).unwrap_or(0) + 1;
        let event = EventMeta {
            id,
            spec,
            attachment,
            created_at: Utc::now(),
        };
        events.push(event.clone());
        Ok(event)
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn list_events(&self, after: EventId, limit: usize) -> TrellisResult<Vec<EventMeta>> {
        let events = self
            .events
            .read()
            .map_err(|_| TrellisError::poisoned("event-log"))?;
        // ids ascend, so the first newer event is found by partition
        let start = events.partition_point(|e| e.id <= after);
        Ok(events[start..].iter().take(limit).cloned().collect())
    }

    async fn cursor_reminder(&self) -> TrellisResult<EventId> {
        let events = self
            .events
            .read()
            .map_err(|_| TrellisError::poisoned("event-log"))?;
        Ok(events.last().map(|e| e.id).unwrap_or(0))
    }
}

// ============================================================================
// STORE-BACKED LOG
// ============================================================================

/// Change log kept in one durable-store sorted set, scored by event id.
///
/// Every feed process sharing the store reads the same log. `append`
/// assigns ids from the current head and expects a single writer.
pub struct StoreEventLog {
    store: Arc<dyn DurableStore>,
    key: String,
}

impl StoreEventLog {
    pub const DEFAULT_KEY: &'static str = "trellis:event-log";

    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            key: Self::DEFAULT_KEY.to_string(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub async fn append(&self, spec: EventSpec, attachment: EventAttachment) -> TrellisResult<EventMeta> {
        let event = EventMeta {
            id: self.cursor_reminder().await? + 1,
            spec,
            attachment,
            created_at: Utc::now(),
        };
        let member = serde_json::to_string(&event).map_err(|e| TrellisError::codec("event", e))?;
        self.store.zadd(&self.key, event.id as f64, &member).await?;
        Ok(event)
    }

    async fn read_from(&self, min: f64) -> TrellisResult<Vec<EventMeta>> {
        self.store
            .zrange_by_score(&self.key, min, f64::INFINITY)
            .await?
            .iter()
            .map(|raw| serde_json::from_str(raw).map_err(|e| TrellisError::codec("event", e)))
            .collect()
    }
}

#[async_trait]
impl EventLog for StoreEventLog {
    async fn list_events(&self, after: EventId, limit: usize) -> TrellisResult<Vec<EventMeta>> {
        let mut events = self.read_from((after + 1) as f64).await?;
        events.truncate(limit);
        Ok(events)
    }

    async fn cursor_reminder(&self) -> TrellisResult<EventId> {
        let events = self.read_from(f64::NEG_INFINITY).await?;
        Ok(events.last().map(|e| e.id).unwrap_or(0))
    }
}
