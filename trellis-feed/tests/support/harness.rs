#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use trellis_core::{EventId, EventMeta};
use trellis_feed::{
    CommittedCursor, FeedMetrics, LocalCacheConfig, LocalCaches, MatcherConfig, PayloadBuilder,
    ReleaseMatcher, Scheduler, SchedulerConfig,
};
use trellis_storage::{
    InMemoryDurableStore, InMemorySource, RemoteCache, RemoteCacheConfig, RemoteCacheMetrics,
    RemotePurger,
};

pub const REPOSITORY_ROOT: &str = "https://repo.trellis.test/";

/// Committed cursor a test moves by hand.
pub struct FixedCursor {
    value: AtomicU64,
    period: Duration,
}

impl FixedCursor {
    pub fn new(value: EventId) -> Self {
        Self {
            value: AtomicU64::new(value),
            period: Duration::from_millis(20),
        }
    }

    pub fn set(&self, value: EventId) {
        self.value.store(value, Ordering::SeqCst);
    }
}

impl CommittedCursor for FixedCursor {
    fn committed(&self) -> EventId {
        self.value.load(Ordering::SeqCst)
    }

    fn poll_period(&self) -> Duration {
        self.period
    }
}

/// Limits generous enough that tests never wait on a limiter.
pub fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_retry_rate(1_000, 1_000)
        .with_subscribe_catch_up(Duration::from_millis(200))
}

pub fn matcher_config() -> MatcherConfig {
    MatcherConfig::default()
        .with_rate(10_000, 10_000)
        .with_wait(Duration::from_millis(200))
}

/// Both cache tiers, the matcher and a scheduler over one in-memory source.
pub struct Harness {
    pub registry: Registry,
    pub metrics: FeedMetrics,
    pub source: Arc<InMemorySource>,
    pub store: Arc<InMemoryDurableStore>,
    pub remote: Arc<RemoteCache>,
    pub caches: Arc<LocalCaches>,
    pub matcher: Arc<ReleaseMatcher>,
    pub cursor: Arc<FixedCursor>,
    pub scheduler: Arc<Scheduler>,
}

impl Harness {
    pub fn new(source: InMemorySource) -> Self {
        Self::with_config(source, LocalCacheConfig::default(), scheduler_config())
    }

    pub fn with_config(
        source: InMemorySource,
        local: LocalCacheConfig,
        scheduler: SchedulerConfig,
    ) -> Self {
        let registry = Registry::new();
        let metrics = FeedMetrics::new(&registry).unwrap();
        let source = Arc::new(source);
        let store = Arc::new(InMemoryDurableStore::new());
        let remote = Arc::new(RemoteCache::new(
            store.clone(),
            source.clone(),
            &RemoteCacheConfig::default(),
            RemoteCacheMetrics::new(&registry).unwrap(),
        ));
        let caches = Arc::new(LocalCaches::new(remote.clone(), &local, metrics.clone()));
        let matcher = Arc::new(ReleaseMatcher::new(
            caches.clone(),
            remote.clone(),
            &matcher_config(),
            metrics.clone(),
        ));
        let cursor = Arc::new(FixedCursor::new(0));
        let scheduler = Arc::new(Scheduler::new(
            matcher.clone(),
            PayloadBuilder::new(caches.clone(), REPOSITORY_ROOT),
            cursor.clone(),
            scheduler,
            metrics.clone(),
        ));
        Self {
            registry,
            metrics,
            source,
            store,
            remote,
            caches,
            matcher,
            cursor,
            scheduler,
        }
    }

    /// Apply events the way the change observer does: purge both tiers,
    /// commit the cursor, then hand the batch to the scheduler.
    pub async fn commit(&self, events: &[EventMeta]) {
        RemotePurger::new(self.store.clone())
            .purge(events)
            .await
            .unwrap();
        self.caches.purge(events).unwrap();
        if let Some(last) = events.last() {
            self.cursor.set(last.id);
        }
        self.scheduler.dispatch(events);
    }
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
