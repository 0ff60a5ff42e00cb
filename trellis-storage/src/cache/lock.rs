//! Per-resource-kind singleflight locks.
//!
//! Each kind owns a pool of exclusive refresh slots keyed by cache key and an
//! admission limiter every acquisition passes through. An acquisition ends in
//! one of three states:
//!
//! - `acquired`: this caller owns the key's refresh slot.
//! - `with_limit`: the slot pool is saturated; the caller refreshes directly
//!   without exclusivity, possibly duplicating work under load.
//! - neither: another caller holds the slot; wait for it, then re-read.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use trellis_core::{ResourceKind, TrellisError, TrellisResult};

use super::config::RemoteCacheConfig;
use crate::limiter::{direct_limiter, DirectRateLimiter};
use crate::metrics::RemoteCacheMetrics;

struct KindLock {
    limiter: DirectRateLimiter,
    slots: Mutex<HashMap<String, watch::Sender<bool>>>,
    pool_size: usize,
}

impl KindLock {
    fn finish(&self, key: &str) {
        let sender = match self.slots.lock() {
            Ok(mut slots) => slots.remove(key),
            Err(poisoned) => poisoned.into_inner().remove(key),
        };
        if let Some(sender) = sender {
            let _ = sender.send(true);
        }
    }

    fn holders(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// Ownership of an exclusive refresh slot. Dropping it frees the slot, so a
/// cancelled holder never strands waiters.
struct Lease {
    lock: Arc<KindLock>,
    key: String,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.lock.finish(&self.key);
    }
}

/// Outcome of [`ResourceLocks::acquire`].
pub struct LockState {
    kind: ResourceKind,
    acquired: bool,
    with_limit: bool,
    _lease: Option<Lease>,
    waiter: Option<watch::Receiver<bool>>,
}

impl LockState {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn acquired(&self) -> bool {
        self.acquired
    }

    pub fn with_limit(&self) -> bool {
        self.with_limit
    }

    /// Whether the caller should query the source of record itself.
    pub fn should_refresh(&self) -> bool {
        self.acquired || self.with_limit
    }

    /// Wait until the current holder releases, or `wait` elapses.
    ///
    /// Returns true if the holder finished within the wait.
    pub async fn wait_holder(&mut self, wait: Duration) -> bool {
        let Some(waiter) = self.waiter.as_mut() else {
            return true;
        };
        match tokio::time::timeout(wait, waiter.wait_for(|done| *done)).await {
            Ok(_) => true,
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockState")
            .field("kind", &self.kind)
            .field("acquired", &self.acquired)
            .field("with_limit", &self.with_limit)
            .finish()
    }
}

/// Singleflight locks for every resource kind.
pub struct ResourceLocks {
    locks: HashMap<ResourceKind, Arc<KindLock>>,
    wait: Duration,
    metrics: RemoteCacheMetrics,
}

impl ResourceLocks {
    pub fn new(config: &RemoteCacheConfig, metrics: RemoteCacheMetrics) -> Self {
        let locks = ResourceKind::ALL
            .iter()
            .map(|kind| {
                (
                    *kind,
                    Arc::new(KindLock {
                        limiter: direct_limiter(config.lock_admission),
                        slots: Mutex::new(HashMap::new()),
                        pool_size: config.lock_pool_size.max(1),
                    }),
                )
            })
            .collect();
        Self {
            locks,
            wait: config.lock_wait,
            metrics,
        }
    }

    /// How long a non-holder waits for the holder.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    fn lock_for(&self, kind: ResourceKind) -> TrellisResult<&Arc<KindLock>> {
        self.locks
            .get(&kind)
            .ok_or_else(|| TrellisError::InvalidParameter(format!("no lock pool for {}", kind)))
    }

    /// Acquire the refresh slot of `key`. Blocks on the kind's admission limiter.
    pub async fn acquire(&self, kind: ResourceKind, key: &str) -> TrellisResult<LockState> {
        let lock = self.lock_for(kind)?;
        lock.limiter.until_ready().await;

        let mut slots = lock
            .slots
            .lock()
            .map_err(|_| TrellisError::poisoned(format!("lock-pool:{}", kind)))?;

        if let Some(holder) = slots.get(key) {
            self.metrics.record_lock(kind, "waited");
            return Ok(LockState {
                kind,
                acquired: false,
                with_limit: false,
                _lease: None,
                waiter: Some(holder.subscribe()),
            });
        }

        if slots.len() >= lock.pool_size {
            self.metrics.record_lock(kind, "with_limit");
            tracing::debug!(kind = %kind, key = %key, "lock pool saturated, refreshing without exclusivity");
            return Ok(LockState {
                kind,
                acquired: false,
                with_limit: true,
                _lease: None,
                waiter: None,
            });
        }

        let (tx, _rx) = watch::channel(false);
        slots.insert(key.to_string(), tx);
        drop(slots);

        self.metrics.record_lock(kind, "acquired");
        Ok(LockState {
            kind,
            acquired: true,
            with_limit: false,
            _lease: Some(Lease {
                lock: Arc::clone(lock),
                key: key.to_string(),
            }),
            waiter: None,
        })
    }

    /// Release a lock state, recording whether the refresh succeeded.
    pub fn release(&self, state: LockState, success: bool) {
        if state.should_refresh() {
            self.metrics.record_refresh(state.kind, success);
        }
        if !success {
            tracing::debug!(kind = %state.kind, "refresh failed, releasing slot");
        }
        drop(state);
    }

    /// Number of slots currently held for `kind`.
    pub fn holders(&self, kind: ResourceKind) -> usize {
        self.locks.get(&kind).map(|l| l.holders()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;

    fn locks(pool: usize) -> ResourceLocks {
        let config = RemoteCacheConfig::default()
            .with_lock_pool_size(pool)
            .with_lock_admission(10_000, 10_000);
        ResourceLocks::new(&config, RemoteCacheMetrics::new(&Registry::new()).unwrap())
    }

    #[tokio::test]
    async fn test_second_caller_waits_for_holder() {
        let locks = locks(8);
        let holder = locks.acquire(ResourceKind::AppMeta, "k").await.unwrap();
        assert!(holder.acquired());

        let mut waiter = locks.acquire(ResourceKind::AppMeta, "k").await.unwrap();
        assert!(!waiter.acquired());
        assert!(!waiter.with_limit());
        assert!(!waiter.should_refresh());

        assert!(!waiter.wait_holder(Duration::from_millis(10)).await);
        locks.release(holder, true);
        assert!(waiter.wait_holder(Duration::from_millis(10)).await);
        assert_eq!(locks.holders(ResourceKind::AppMeta), 0);
    }

    #[tokio::test]
    async fn test_saturated_pool_grants_with_limit() {
        let locks = locks(1);
        let first = locks.acquire(ResourceKind::Strategy, "a").await.unwrap();
        let second = locks.acquire(ResourceKind::Strategy, "b").await.unwrap();
        assert!(first.acquired());
        assert!(!second.acquired());
        assert!(second.with_limit());
        assert!(second.should_refresh());

        // Pools are per kind
        let other = locks.acquire(ResourceKind::AppMeta, "a").await.unwrap();
        assert!(other.acquired());
    }

    #[tokio::test]
    async fn test_dropped_holder_frees_slot() {
        let locks = locks(4);
        let holder = locks.acquire(ResourceKind::Credential, "t").await.unwrap();
        let mut waiter = locks.acquire(ResourceKind::Credential, "t").await.unwrap();
        drop(holder);
        assert!(waiter.wait_holder(Duration::from_millis(10)).await);
        let again = locks.acquire(ResourceKind::Credential, "t").await.unwrap();
        assert!(again.acquired());
    }
}
