//! Redis-backed durable store.

use super::{DurableStore, StoreEntry};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::fmt;
use std::time::Duration;
use trellis_core::{TrellisError, TrellisResult};

/// Durable store over a shared redis connection manager.
#[derive(Clone)]
pub struct RedisDurableStore {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisDurableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisDurableStore")
            .field("conn", &"<ConnectionManager>")
            .finish()
    }
}

impl RedisDurableStore {
    pub async fn connect(url: &str) -> TrellisResult<Self> {
        let client = redis::Client::open(url).map_err(|e| TrellisError::backend("open", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| TrellisError::Unavailable(format!("redis connect: {}", e)))?;
        tracing::info!(url = %url, "Connected to redis durable store");
        Ok(Self { conn })
    }
}

/// Expiry in milliseconds, so jittered and sub-second TTLs survive.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl DurableStore for RedisDurableStore {
    async fn get(&self, key: &str) -> TrellisResult<Option<String>> {
        self.conn
            .clone()
            .get(key)
            .await
            .map_err(|e| TrellisError::backend("get", e))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> TrellisResult<()> {
        self.conn
            .clone()
            .pset_ex::<_, _, ()>(key, value, ttl_millis(ttl))
            .await
            .map_err(|e| TrellisError::backend("set", e))
    }

    async fn mget(&self, keys: &[String]) -> TrellisResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| TrellisError::backend("mget", e))
    }

    async fn mset(&self, entries: &[StoreEntry]) -> TrellisResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for entry in entries {
            pipe.pset_ex(&entry.key, &entry.value, ttl_millis(entry.ttl))
                .ignore();
        }
        let _: () = pipe
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| TrellisError::backend("mset", e))?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> TrellisResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.conn
            .clone()
            .del(keys)
            .await
            .map_err(|e| TrellisError::backend("del", e))
    }

    async fn keys(&self, pattern: &str) -> TrellisResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(|e| TrellisError::backend("scan", e))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> TrellisResult<()> {
        self.conn
            .clone()
            .zadd::<_, _, _, ()>(key, member, score)
            .await
            .map_err(|e| TrellisError::backend("zadd", e))
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> TrellisResult<Vec<String>> {
        self.conn
            .clone()
            .zrangebyscore(key, min, max)
            .await
            .map_err(|e| TrellisError::backend("zrangebyscore", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_keeps_milliseconds() {
        assert_eq!(ttl_millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(ttl_millis(Duration::from_millis(250)), 250);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::MAX), u64::MAX);
    }
}
