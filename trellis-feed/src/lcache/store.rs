//! TTL-aware LRU shared by every local cache.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use trellis_core::{TrellisError, TrellisResult};

use super::LocalKind;
use crate::config::ResourceCacheConfig;
use crate::telemetry::FeedMetrics;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// One bounded LRU with per-entry expiry and hit/miss accounting.
///
/// Expired entries are dropped lazily on lookup. Evictions caused by
/// capacity pressure are counted, replacements of the same key are not.
pub struct LocalStore<K: Hash + Eq, V> {
    kind: LocalKind,
    entries: Mutex<LruCache<K, Entry<V>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    metrics: FeedMetrics,
}

impl<K: Hash + Eq + Clone, V: Clone> LocalStore<K, V> {
    pub fn new(kind: LocalKind, config: ResourceCacheConfig, metrics: FeedMetrics) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            kind,
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: config.ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn kind(&self) -> LocalKind {
        self.kind
    }

    fn poisoned(&self) -> TrellisError {
        TrellisError::poisoned(format!("lcache:{}", self.kind))
    }

    /// Look up a live entry, counting the hit or miss.
    pub fn lookup(&self, key: &K) -> TrellisResult<Option<V>> {
        let mut entries = self.entries.lock().map_err(|_| self.poisoned())?;
        let now = Instant::now();
        let found = match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        };
        drop(entries);

        let label = [self.kind.as_str()];
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.metrics.lcache_hits_total.with_label_values(&label).inc();
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.metrics.lcache_misses_total.with_label_values(&label).inc();
        }
        Ok(found)
    }

    pub fn insert(&self, key: K, value: V) -> TrellisResult<()> {
        self.insert_with_ttl(key, value, self.ttl)
    }

    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) -> TrellisResult<()> {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        let mut entries = self.entries.lock().map_err(|_| self.poisoned())?;
        let replaced = entries.push(key.clone(), entry);
        drop(entries);

        if let Some((old_key, _)) = replaced {
            if old_key != key {
                self.metrics
                    .lcache_evictions_total
                    .with_label_values(&[self.kind.as_str()])
                    .inc();
            }
        }
        Ok(())
    }

    pub fn invalidate(&self, key: &K) -> TrellisResult<bool> {
        let mut entries = self.entries.lock().map_err(|_| self.poisoned())?;
        Ok(entries.pop(key).is_some())
    }

    /// Drop every entry for which `drop_if` returns true. Returns how many went.
    pub fn remove_where(&self, drop_if: impl Fn(&K, &V) -> bool) -> TrellisResult<usize> {
        let mut entries = self.entries.lock().map_err(|_| self.poisoned())?;
        let doomed: Vec<K> = entries
            .iter()
            .filter(|(k, e)| drop_if(k, &e.value))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        Ok(doomed.len())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record_error(&self) {
        self.metrics
            .lcache_errors_total
            .with_label_values(&[self.kind.as_str()])
            .inc();
    }

    /// Lifetime hit ratio, 0 before the first lookup.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
