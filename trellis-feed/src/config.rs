//! Feed Configuration Module
//!
//! Every tunable of the feed process lives in a plain struct with a
//! `Default` impl and a `from_env()` constructor. Unparsable environment
//! values fall back to the defaults in `trellis_core::constants`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use trellis_core::config::{env_duration_ms, env_duration_secs, env_or};
use trellis_core::constants::*;
use trellis_core::RateLimit;
use trellis_events::ObserverConfig;
use trellis_storage::RemoteCacheConfig;

use crate::lcache::LocalKind;
use crate::telemetry::TelemetryConfig;

// ============================================================================
// LOCAL CACHE TIER
// ============================================================================

/// Sizing of one local LRU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceCacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
    /// Payloads at or above this size are served but never admitted.
    pub max_payload_bytes: usize,
}

impl Default for ResourceCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LOCAL_CAPACITY,
            ttl: DEFAULT_LOCAL_TTL,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl ResourceCacheConfig {
    pub fn new(capacity: usize, ttl: Duration, max_payload_bytes: usize) -> Self {
        Self {
            capacity,
            ttl,
            max_payload_bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalCacheConfig {
    /// Per-resource sizing; resources not listed use `ResourceCacheConfig::default()`.
    pub resources: HashMap<LocalKind, ResourceCacheConfig>,
    /// How long a denied authorization is remembered.
    pub negative_auth_ttl: Duration,
    /// Period of the hit-ratio sampler.
    pub sample_interval: Duration,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            resources: HashMap::new(),
            negative_auth_ttl: NEGATIVE_AUTH_TTL,
            sample_interval: HIT_RATIO_SAMPLE_INTERVAL,
        }
    }
}

impl LocalCacheConfig {
    /// Create LocalCacheConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TRELLIS_LCACHE_<KIND>_CAPACITY`, e.g. `TRELLIS_LCACHE_APP_META_CAPACITY=5000`
    /// - `TRELLIS_LCACHE_<KIND>_TTL_SECS`
    /// - `TRELLIS_LCACHE_<KIND>_MAX_PAYLOAD_BYTES`
    /// - `TRELLIS_LCACHE_NEGATIVE_AUTH_TTL_SECS` (default: 30)
    /// - `TRELLIS_LCACHE_SAMPLE_INTERVAL_SECS` (default: 5)
    pub fn from_env() -> Self {
        let defaults = ResourceCacheConfig::default();
        let resources = LocalKind::ALL
            .iter()
            .map(|kind| {
                let prefix = format!("TRELLIS_LCACHE_{}", kind.env_name());
                let config = ResourceCacheConfig {
                    capacity: env_or(&format!("{}_CAPACITY", prefix), defaults.capacity).max(1),
                    ttl: env_duration_secs(&format!("{}_TTL_SECS", prefix), defaults.ttl),
                    max_payload_bytes: env_or(
                        &format!("{}_MAX_PAYLOAD_BYTES", prefix),
                        defaults.max_payload_bytes,
                    ),
                };
                (*kind, config)
            })
            .collect();

        Self {
            resources,
            negative_auth_ttl: env_duration_secs(
                "TRELLIS_LCACHE_NEGATIVE_AUTH_TTL_SECS",
                NEGATIVE_AUTH_TTL,
            ),
            sample_interval: env_duration_secs(
                "TRELLIS_LCACHE_SAMPLE_INTERVAL_SECS",
                HIT_RATIO_SAMPLE_INTERVAL,
            ),
        }
    }

    pub fn resource(&self, kind: LocalKind) -> ResourceCacheConfig {
        self.resources.get(&kind).copied().unwrap_or_default()
    }

    pub fn with_resource(mut self, kind: LocalKind, config: ResourceCacheConfig) -> Self {
        self.resources.insert(kind, config);
        self
    }

    pub fn with_negative_auth_ttl(mut self, ttl: Duration) -> Self {
        self.negative_auth_ttl = ttl;
        self
    }
}

// ============================================================================
// RELEASE MATCHER
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct MatcherConfig {
    pub rate: RateLimit,
    /// How long a caller may wait for a matcher permit.
    pub wait: Duration,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            rate: RateLimit::new(DEFAULT_MATCHER_QPS, DEFAULT_MATCHER_BURST),
            wait: DEFAULT_MATCHER_WAIT,
        }
    }
}

impl MatcherConfig {
    /// `TRELLIS_MATCHER_QPS`, `TRELLIS_MATCHER_BURST`, `TRELLIS_MATCHER_WAIT_MS`.
    pub fn from_env() -> Self {
        Self {
            rate: RateLimit::new(
                env_or("TRELLIS_MATCHER_QPS", DEFAULT_MATCHER_QPS),
                env_or("TRELLIS_MATCHER_BURST", DEFAULT_MATCHER_BURST),
            ),
            wait: env_duration_ms("TRELLIS_MATCHER_WAIT_MS", DEFAULT_MATCHER_WAIT),
        }
    }

    pub fn with_rate(mut self, qps: u32, burst: u32) -> Self {
        self.rate = RateLimit::new(qps, burst);
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

// ============================================================================
// NOTIFICATION SCHEDULER
// ============================================================================

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Max concurrent member notifications across all apps.
    pub notify_concurrency: usize,

    /// How long a fanout waits for a notify permit before queueing a retry.
    pub notify_acquire_timeout: Duration,

    /// How long a subscribe waits for the observer to reach the client's cursor.
    pub subscribe_catch_up: Duration,

    /// Token bucket of the retry drain loop.
    pub retry_rate: RateLimit,

    /// Max actors draining events at once.
    pub actor_workers: usize,

    /// An actor with no consumers and no work is reaped after this long.
    pub idle_actor_timeout: Duration,

    pub reap_interval: Duration,

    /// Buffered messages per watch connection.
    pub watch_channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            notify_concurrency: DEFAULT_NOTIFY_CONCURRENCY,
            notify_acquire_timeout: DEFAULT_NOTIFY_ACQUIRE_TIMEOUT,
            subscribe_catch_up: DEFAULT_SUBSCRIBE_CATCH_UP,
            retry_rate: RateLimit::new(DEFAULT_RETRY_QPS, DEFAULT_RETRY_BURST),
            actor_workers: DEFAULT_ACTOR_WORKERS,
            idle_actor_timeout: DEFAULT_IDLE_ACTOR_TIMEOUT,
            reap_interval: DEFAULT_REAP_INTERVAL,
            watch_channel_capacity: DEFAULT_WATCH_CHANNEL_CAPACITY,
        }
    }
}

impl SchedulerConfig {
    /// Create SchedulerConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TRELLIS_NOTIFY_CONCURRENCY` (default: 500)
    /// - `TRELLIS_NOTIFY_ACQUIRE_TIMEOUT_MS` (default: 200)
    /// - `TRELLIS_SUBSCRIBE_CATCH_UP_MS` (default: 3000)
    /// - `TRELLIS_RETRY_QPS`, `TRELLIS_RETRY_BURST` (default: 1, 1)
    /// - `TRELLIS_ACTOR_WORKERS` (default: 64)
    /// - `TRELLIS_IDLE_ACTOR_TIMEOUT_SECS` (default: 600)
    /// - `TRELLIS_REAP_INTERVAL_SECS` (default: 60)
    /// - `TRELLIS_WATCH_CHANNEL_CAPACITY` (default: 64)
    pub fn from_env() -> Self {
        Self {
            notify_concurrency: env_or("TRELLIS_NOTIFY_CONCURRENCY", DEFAULT_NOTIFY_CONCURRENCY)
                .max(1),
            notify_acquire_timeout: env_duration_ms(
                "TRELLIS_NOTIFY_ACQUIRE_TIMEOUT_MS",
                DEFAULT_NOTIFY_ACQUIRE_TIMEOUT,
            ),
            subscribe_catch_up: env_duration_ms(
                "TRELLIS_SUBSCRIBE_CATCH_UP_MS",
                DEFAULT_SUBSCRIBE_CATCH_UP,
            ),
            retry_rate: RateLimit::new(
                env_or("TRELLIS_RETRY_QPS", DEFAULT_RETRY_QPS),
                env_or("TRELLIS_RETRY_BURST", DEFAULT_RETRY_BURST),
            ),
            actor_workers: env_or("TRELLIS_ACTOR_WORKERS", DEFAULT_ACTOR_WORKERS).max(1),
            idle_actor_timeout: env_duration_secs(
                "TRELLIS_IDLE_ACTOR_TIMEOUT_SECS",
                DEFAULT_IDLE_ACTOR_TIMEOUT,
            ),
            reap_interval: env_duration_secs("TRELLIS_REAP_INTERVAL_SECS", DEFAULT_REAP_INTERVAL),
            watch_channel_capacity: env_or(
                "TRELLIS_WATCH_CHANNEL_CAPACITY",
                DEFAULT_WATCH_CHANNEL_CAPACITY,
            )
            .max(1),
        }
    }

    pub fn with_notify_concurrency(mut self, n: usize) -> Self {
        self.notify_concurrency = n.max(1);
        self
    }

    pub fn with_notify_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.notify_acquire_timeout = timeout;
        self
    }

    pub fn with_subscribe_catch_up(mut self, budget: Duration) -> Self {
        self.subscribe_catch_up = budget;
        self
    }

    pub fn with_retry_rate(mut self, qps: u32, burst: u32) -> Self {
        self.retry_rate = RateLimit::new(qps, burst);
        self
    }

    pub fn with_idle_actor_timeout(mut self, timeout: Duration) -> Self {
        self.idle_actor_timeout = timeout;
        self
    }

    pub fn with_watch_channel_capacity(mut self, capacity: usize) -> Self {
        self.watch_channel_capacity = capacity.max(1);
        self
    }
}

// ============================================================================
// PROCESS
// ============================================================================

/// Everything `feed-server` needs to start.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Listen address, e.g. `0.0.0.0:9510`.
    pub bind: String,

    /// Root of the content repository sidecars download from.
    pub repository_root: String,

    /// JSON snapshot seeding the in-memory source of record.
    pub snapshot_path: Option<PathBuf>,

    /// Durable store URL; the in-memory store is used when unset.
    pub store_url: Option<String>,

    /// How long shutdown waits for watch handlers to say goodbye.
    pub shutdown_budget: Duration,

    pub remote: RemoteCacheConfig,
    pub observer: ObserverConfig,
    pub local: LocalCacheConfig,
    pub matcher: MatcherConfig,
    pub scheduler: SchedulerConfig,
    pub telemetry: TelemetryConfig,
}

impl FeedConfig {
    /// Create FeedConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TRELLIS_BIND` (default: `0.0.0.0:9510`)
    /// - `TRELLIS_REPOSITORY_ROOT` (default: `/data/repository`)
    /// - `TRELLIS_SNAPSHOT`: path of a source snapshot
    /// - `TRELLIS_STORE_URL`: e.g. `redis://127.0.0.1:6379`
    /// - `TRELLIS_SHUTDOWN_BUDGET_SECS` (default: 10)
    ///
    /// plus the variables read by each component config.
    pub fn from_env() -> Self {
        Self {
            bind: env_or("TRELLIS_BIND", "0.0.0.0:9510".to_string()),
            repository_root: env_or("TRELLIS_REPOSITORY_ROOT", "/data/repository".to_string()),
            snapshot_path: std::env::var("TRELLIS_SNAPSHOT").ok().map(PathBuf::from),
            store_url: std::env::var("TRELLIS_STORE_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            shutdown_budget: env_duration_secs(
                "TRELLIS_SHUTDOWN_BUDGET_SECS",
                Duration::from_secs(10),
            ),
            remote: RemoteCacheConfig::from_env(),
            observer: ObserverConfig::from_env(),
            local: LocalCacheConfig::from_env(),
            matcher: MatcherConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
            telemetry: TelemetryConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlisted_resource_uses_defaults() {
        let config = LocalCacheConfig::default();
        assert_eq!(config.resource(LocalKind::AppMeta), ResourceCacheConfig::default());
        assert_eq!(config.negative_auth_ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_resource_override() {
        let tiny = ResourceCacheConfig::new(1, Duration::from_secs(5), 64);
        let config = LocalCacheConfig::default().with_resource(LocalKind::Credential, tiny);
        assert_eq!(config.resource(LocalKind::Credential), tiny);
        assert_eq!(config.resource(LocalKind::AppMeta).capacity, DEFAULT_LOCAL_CAPACITY);
    }

    #[test]
    fn test_scheduler_builders_clamp() {
        let config = SchedulerConfig::default()
            .with_notify_concurrency(0)
            .with_watch_channel_capacity(0);
        assert_eq!(config.notify_concurrency, 1);
        assert_eq!(config.watch_channel_capacity, 1);
    }
}
