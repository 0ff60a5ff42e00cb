//! In-memory durable store used by tests and the dev server.

use super::{DurableStore, StoreEntry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;
use trellis_core::{Glob, TrellisError, TrellisResult};

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Instant,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// TTL-aware in-memory store with sorted sets.
///
/// Expiry is measured on the tokio clock so paused-time tests can advance it.
#[derive(Debug, Default)]
pub struct InMemoryDurableStore {
    values: RwLock<HashMap<String, Slot>>,
    sorted: RwLock<HashMap<String, Vec<(f64, String)>>>,
    writes: AtomicU64,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining TTL of a live key.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let values = self.values.read().ok()?;
        values
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.expires_at.saturating_duration_since(now))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.values
            .read()
            .map(|v| v.values().filter(|s| s.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of set/mset calls served.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn read_live(&self, key: &str, now: Instant) -> TrellisResult<Option<String>> {
        let values = self
            .values
            .read()
            .map_err(|_| TrellisError::poisoned("durable-store"))?;
        Ok(values
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value.clone()))
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get(&self, key: &str) -> TrellisResult<Option<String>> {
        self.read_live(key, Instant::now())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> TrellisResult<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| TrellisError::poisoned("durable-store"))?;
        values.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> TrellisResult<Vec<Option<String>>> {
        let now = Instant::now();
        keys.iter().map(|k| self.read_live(k, now)).collect()
    }

    async fn mset(&self, entries: &[StoreEntry]) -> TrellisResult<()> {
        let now = Instant::now();
        let mut values = self
            .values
            .write()
            .map_err(|_| TrellisError::poisoned("durable-store"))?;
        for entry in entries {
            values.insert(
                entry.key.clone(),
                Slot {
                    value: entry.value.clone(),
                    expires_at: now + entry.ttl,
                },
            );
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> TrellisResult<u64> {
        let mut values = self
            .values
            .write()
            .map_err(|_| TrellisError::poisoned("durable-store"))?;
        let mut sorted = self
            .sorted
            .write()
            .map_err(|_| TrellisError::poisoned("durable-store"))?;
        let removed = keys
            .iter()
            .filter(|k| values.remove(k.as_str()).is_some() | sorted.remove(k.as_str()).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn keys(&self, pattern: &str) -> TrellisResult<Vec<String>> {
        let glob = Glob::new(pattern)?;
        let now = Instant::now();
        let values = self
            .values
            .read()
            .map_err(|_| TrellisError::poisoned("durable-store"))?;
        let mut keys: Vec<String> = values
            .iter()
            .filter(|(k, slot)| slot.is_live(now) && glob.is_match(k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> TrellisResult<()> {
        let mut sorted = self
            .sorted
            .write()
            .map_err(|_| TrellisError::poisoned("durable-store"))?;
        let set = sorted.entry(key.to_string()).or_default();
        set.retain(|(_, m)| m != member);
        let at = set.partition_point(|(s, m)| (*s, m.as_str()) < (score, member));
        set.insert(at, (score, member.to_string()));
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> TrellisResult<Vec<String>> {
        let sorted = self
            .sorted
            .read()
            .map_err(|_| TrellisError::poisoned("durable-store"))?;
        Ok(sorted
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(s, _)| *s >= min && *s <= max)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}
