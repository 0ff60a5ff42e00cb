//! Change observer: polls the change log, purges caches, then broadcasts.

use async_trait::async_trait;
use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter, IntGauge,
    Registry,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use trellis_core::config::{env_duration_ms, env_duration_secs, env_or};
use trellis_core::constants::{
    OBSERVER_PAGE_SIZE, OBSERVER_PERIOD, OBSERVER_RETRY_BACKOFF, OBSERVER_STARTUP_BUDGET,
    OBSERVER_SUBSCRIBER_CAPACITY,
};
use trellis_core::{EventId, EventMeta, TrellisError, TrellisResult};

use crate::log::EventLog;

/// A batch of events shared by every subscriber.
pub type EventBatch = Arc<Vec<EventMeta>>;

/// Drops cache entries made stale by events. Called before any subscriber
/// sees the batch.
#[async_trait]
pub trait CachePurger: Send + Sync {
    async fn purge(&self, events: &[EventMeta]) -> TrellisResult<()>;
}

/// Purger for deployments without caches to invalidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPurger;

#[async_trait]
impl CachePurger for NoopPurger {
    async fn purge(&self, _events: &[EventMeta]) -> TrellisResult<()> {
        Ok(())
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// Poll period of the change log (default: 250ms)
    pub period: Duration,

    /// Maximum events fetched per poll (default: 200)
    pub page_size: usize,

    /// How long startup may wait for the initial cursor (default: 30s)
    pub startup_budget: Duration,

    /// Sleep after a failed fetch or purge before retrying (default: 1s)
    pub retry_backoff: Duration,

    /// Buffered batches per subscriber
    pub subscriber_capacity: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            period: OBSERVER_PERIOD,
            page_size: OBSERVER_PAGE_SIZE,
            startup_budget: OBSERVER_STARTUP_BUDGET,
            retry_backoff: OBSERVER_RETRY_BACKOFF,
            subscriber_capacity: OBSERVER_SUBSCRIBER_CAPACITY,
        }
    }
}

impl ObserverConfig {
    /// Create ObserverConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TRELLIS_OBSERVER_PERIOD_MS` (default: 250)
    /// - `TRELLIS_OBSERVER_PAGE_SIZE` (default: 200)
    /// - `TRELLIS_OBSERVER_STARTUP_BUDGET_SECS` (default: 30)
    /// - `TRELLIS_OBSERVER_RETRY_BACKOFF_MS` (default: 1000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            period: env_duration_ms("TRELLIS_OBSERVER_PERIOD_MS", defaults.period),
            page_size: env_or("TRELLIS_OBSERVER_PAGE_SIZE", defaults.page_size).max(1),
            startup_budget: env_duration_secs(
                "TRELLIS_OBSERVER_STARTUP_BUDGET_SECS",
                defaults.startup_budget,
            ),
            retry_backoff: env_duration_ms(
                "TRELLIS_OBSERVER_RETRY_BACKOFF_MS",
                defaults.retry_backoff,
            ),
            subscriber_capacity: defaults.subscriber_capacity,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_startup_budget(mut self, budget: Duration) -> Self {
        self.startup_budget = budget;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Clone)]
pub struct ObserverMetrics {
    /// Last committed cursor
    pub cursor: IntGauge,

    /// Events read from the change log
    pub events_total: IntCounter,

    /// Failed change log fetches
    pub fetch_failures_total: IntCounter,

    /// Failed cache purges
    pub purge_failures_total: IntCounter,
}

fn register_failed(name: &str, e: prometheus::Error) -> TrellisError {
    TrellisError::InvalidParameter(format!("Failed to register {}: {}", name, e))
}

impl ObserverMetrics {
    pub fn new(registry: &Registry) -> TrellisResult<Self> {
        Ok(Self {
            cursor: register_int_gauge_with_registry!(
                "trellis_observer_cursor",
                "Last change log id committed by the observer",
                registry
            )
            .map_err(|e| register_failed("trellis_observer_cursor", e))?,

            events_total: register_int_counter_with_registry!(
                "trellis_observer_events_total",
                "Change log events observed",
                registry
            )
            .map_err(|e| register_failed("trellis_observer_events_total", e))?,

            fetch_failures_total: register_int_counter_with_registry!(
                "trellis_observer_fetch_failures_total",
                "Failed change log fetches",
                registry
            )
            .map_err(|e| register_failed("trellis_observer_fetch_failures_total", e))?,

            purge_failures_total: register_int_counter_with_registry!(
                "trellis_observer_purge_failures_total",
                "Failed cache purges",
                registry
            )
            .map_err(|e| register_failed("trellis_observer_purge_failures_total", e))?,
        })
    }
}

// ============================================================================
// OBSERVER
// ============================================================================

struct Subscriber {
    name: String,
    tx: mpsc::Sender<EventBatch>,
}

/// Single polling loop over the change log.
///
/// Delivery is at-least-once: a failed fetch or purge is retried at the
/// unchanged cursor, and the cursor only moves forward once a batch has been
/// purged and handed to every subscriber.
pub struct ChangeObserver {
    log: Arc<dyn EventLog>,
    purger: Arc<dyn CachePurger>,
    config: ObserverConfig,
    metrics: ObserverMetrics,
    cursor: AtomicU64,
    ready: AtomicBool,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl ChangeObserver {
    pub fn new(
        log: Arc<dyn EventLog>,
        purger: Arc<dyn CachePurger>,
        config: ObserverConfig,
        metrics: ObserverMetrics,
    ) -> Self {
        Self {
            log,
            purger,
            config,
            metrics,
            cursor: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    /// Register an output queue. Every later batch is delivered to it in order.
    pub fn subscribe(&self, name: &str) -> TrellisResult<mpsc::Receiver<EventBatch>> {
        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity.max(1));
        self.subscribers
            .lock()
            .map_err(|_| TrellisError::poisoned("observer-subscribers"))?
            .push(Subscriber {
                name: name.to_string(),
                tx,
            });
        Ok(rx)
    }

    /// Last committed cursor.
    pub fn current_cursor(&self) -> EventId {
        self.cursor.load(Ordering::Acquire)
    }

    /// Whether the initial cursor has been fetched.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Fetch the initial cursor, retrying within the startup budget.
    async fn start(&self) -> TrellisResult<EventId> {
        let attempt = async {
            loop {
                match self.log.cursor_reminder().await {
                    Ok(cursor) => return cursor,
                    Err(e) => {
                        self.metrics.fetch_failures_total.inc();
                        tracing::warn!(error = %e, "cursor reminder unavailable, retrying");
                        tokio::time::sleep(self.config.retry_backoff).await;
                    }
                }
            }
        };
        let cursor = tokio::time::timeout(self.config.startup_budget, attempt)
            .await
            .map_err(|_| {
                TrellisError::Timeout(format!(
                    "no cursor reminder within {:?}",
                    self.config.startup_budget
                ))
            })?;

        self.commit(cursor);
        self.ready.store(true, Ordering::Release);
        Ok(cursor)
    }

    fn commit(&self, cursor: EventId) {
        let previous = self.cursor.fetch_max(cursor, Ordering::AcqRel);
        let committed = previous.max(cursor);
        self.metrics.cursor.set(committed as i64);
    }

    /// Fetch, purge and broadcast one page. Returns the number of events handled.
    async fn poll_once(&self) -> TrellisResult<usize> {
        let cursor = self.current_cursor();
        let events = self
            .log
            .list_events(cursor, self.config.page_size)
            .await
            .inspect_err(|_| self.metrics.fetch_failures_total.inc())?;
        let Some(last) = events.last().map(|e| e.id) else {
            return Ok(0);
        };

        self.purger
            .purge(&events)
            .await
            .inspect_err(|_| self.metrics.purge_failures_total.inc())?;

        let count = events.len();
        self.broadcast(Arc::new(events)).await?;
        self.commit(last);
        self.metrics.events_total.inc_by(count as u64);

        tracing::debug!(cursor = last, events = count, "observed change log batch");
        Ok(count)
    }

    async fn broadcast(&self, batch: EventBatch) -> TrellisResult<()> {
        let targets: Vec<(String, mpsc::Sender<EventBatch>)> = self
            .subscribers
            .lock()
            .map_err(|_| TrellisError::poisoned("observer-subscribers"))?
            .iter()
            .map(|s| (s.name.clone(), s.tx.clone()))
            .collect();

        let mut closed = false;
        for (name, tx) in targets {
            if tx.send(Arc::clone(&batch)).await.is_err() {
                tracing::info!(subscriber = %name, "observer subscriber closed");
                closed = true;
            }
        }
        if closed {
            self.subscribers
                .lock()
                .map_err(|_| TrellisError::poisoned("observer-subscribers"))?
                .retain(|s| !s.tx.is_closed());
        }
        Ok(())
    }

    /// Run until `shutdown` fires.
    ///
    /// Fails only if the initial cursor cannot be fetched within the startup
    /// budget; every later failure is logged and retried.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> TrellisResult<()> {
        let cursor = tokio::select! {
            _ = shutdown.cancelled() => {
                return Err(TrellisError::Cancelled("observer stopped during startup".into()));
            }
            started = self.start() => started?,
        };
        tracing::info!(cursor, "change observer ready");

        let mut ticker = interval(self.config.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.poll_once().await {
                tracing::warn!(cursor = self.current_cursor(), error = %e, "change log poll failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.retry_backoff) => {}
                }
            }
        }

        tracing::info!(cursor = self.current_cursor(), "change observer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryEventLog;
    use trellis_core::{EventAttachment, EventSpec, OpType, ResourceType};

    fn metrics() -> ObserverMetrics {
        ObserverMetrics::new(&Registry::new()).unwrap()
    }

    fn publish(release_id: u32) -> EventSpec {
        EventSpec {
            resource: ResourceType::Publish,
            resource_id: release_id,
            op: OpType::Insert,
        }
    }

    #[tokio::test]
    async fn test_start_skips_history() {
        let log = Arc::new(InMemoryEventLog::new());
        let attachment = EventAttachment { biz_id: 2, app_id: 7 };
        log.append(publish(1), attachment).unwrap();
        log.append(publish(2), attachment).unwrap();

        let observer =
            ChangeObserver::new(log, Arc::new(NoopPurger), ObserverConfig::default(), metrics());
        assert!(!observer.is_ready());
        assert_eq!(observer.start().await.unwrap(), 2);
        assert!(observer.is_ready());
        assert_eq!(observer.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_paging_respects_page_size() {
        let log = Arc::new(InMemoryEventLog::new());
        let observer = ChangeObserver::new(
            log.clone(),
            Arc::new(NoopPurger),
            ObserverConfig::default().with_page_size(2),
            metrics(),
        );
        observer.start().await.unwrap();
        let attachment = EventAttachment { biz_id: 2, app_id: 7 };
        for release in 0..5 {
            log.append(publish(release), attachment).unwrap();
        }
        assert_eq!(observer.poll_once().await.unwrap(), 2);
        assert_eq!(observer.poll_once().await.unwrap(), 2);
        assert_eq!(observer.poll_once().await.unwrap(), 1);
        assert_eq!(observer.current_cursor(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_times_out_without_reminder() {
        struct DeadLog;

        #[async_trait]
        impl EventLog for DeadLog {
            async fn list_events(&self, _: EventId, _: usize) -> TrellisResult<Vec<EventMeta>> {
                Err(TrellisError::Unavailable("down".into()))
            }

            async fn cursor_reminder(&self) -> TrellisResult<EventId> {
                Err(TrellisError::Unavailable("down".into()))
            }
        }

        let observer = Arc::new(ChangeObserver::new(
            Arc::new(DeadLog),
            Arc::new(NoopPurger),
            ObserverConfig::default().with_startup_budget(Duration::from_secs(3)),
            metrics(),
        ));
        let err = observer
            .clone()
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TrellisError::Timeout(_)));
        assert!(!observer.is_ready());
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_dropped() {
        let log = Arc::new(InMemoryEventLog::new());
        let observer =
            ChangeObserver::new(log.clone(), Arc::new(NoopPurger), ObserverConfig::default(), metrics());
        drop(observer.subscribe("gone").unwrap());
        let mut live = observer.subscribe("live").unwrap();
        observer.start().await.unwrap();

        log.append(publish(1), EventAttachment { biz_id: 2, app_id: 7 })
            .unwrap();
        observer.poll_once().await.unwrap();
        assert_eq!(live.recv().await.unwrap().len(), 1);
        assert_eq!(observer.subscribers.lock().unwrap().len(), 1);
    }
}
