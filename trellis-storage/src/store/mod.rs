//! Durable key-value and sorted-set store consumed by the remote cache tier.
//!
//! The store is treated as an opaque service: its replication and durability
//! are its own concern. Implementations must be safe to share across tasks.

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::InMemoryDurableStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisDurableStore;

use async_trait::async_trait;
use std::time::Duration;
use trellis_core::TrellisResult;

/// One key written by [`DurableStore::mset`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub key: String,
    pub value: String,
    pub ttl: Duration,
}

impl StoreEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> TrellisResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> TrellisResult<()>;

    /// Values in the order of `keys`; absent keys yield `None`.
    async fn mget(&self, keys: &[String]) -> TrellisResult<Vec<Option<String>>>;

    /// Write every entry or none of them.
    async fn mset(&self, entries: &[StoreEntry]) -> TrellisResult<()>;

    /// Returns the number of keys removed.
    async fn delete(&self, keys: &[String]) -> TrellisResult<u64>;

    /// Keys matching a glob pattern (`*`, `?`).
    async fn keys(&self, pattern: &str) -> TrellisResult<Vec<String>>;

    async fn zadd(&self, key: &str, score: f64, member: &str) -> TrellisResult<()>;

    /// Members with `min <= score <= max`, ascending by score.
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> TrellisResult<Vec<String>>;
}
