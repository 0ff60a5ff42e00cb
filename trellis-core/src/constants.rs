//! Defaults shared across trellis crates.

use crate::config::TtlRange;
use std::time::Duration;

/// API version stamped on every stream message.
pub const API_VERSION: &str = "v1.4";

pub const MAX_UID_LEN: usize = 64;
pub const MAX_LABELS: usize = 32;

/// Hash-tag head of every durable store key.
pub const CACHE_KEY_HEAD: &str = "trellis";

// ============================================================================
// REMOTE CACHE TIER
// ============================================================================

pub const DEFAULT_APP_META_TTL: TtlRange = TtlRange::from_secs(900, 1800);
pub const DEFAULT_RELEASED_TTL: TtlRange = TtlRange::from_secs(1800, 3600);
pub const DEFAULT_STRATEGY_TTL: TtlRange = TtlRange::from_secs(600, 900);
pub const DEFAULT_CREDENTIAL_TTL: TtlRange = TtlRange::from_secs(300, 600);
pub const DEFAULT_SHORT_TTL: TtlRange = TtlRange::from_secs(60, 120);
pub const DEFAULT_NULL_TTL: TtlRange = TtlRange::from_secs(10, 30);

pub const DEFAULT_LOCK_QPS: u32 = 500;
pub const DEFAULT_LOCK_BURST: u32 = 50;
pub const DEFAULT_LOCK_POOL_SIZE: usize = 1000;
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(150);
pub const DEFAULT_STRATEGY_PAGE_SIZE: usize = 100;

/// Stored in place of a value confirmed absent in the source of record.
pub const NULL_VALUE: &str = "__trellis_null__";

// ============================================================================
// CHANGE OBSERVER
// ============================================================================

pub const OBSERVER_PERIOD: Duration = Duration::from_millis(250);
pub const OBSERVER_PAGE_SIZE: usize = 200;
pub const OBSERVER_STARTUP_BUDGET: Duration = Duration::from_secs(30);
pub const OBSERVER_RETRY_BACKOFF: Duration = Duration::from_secs(1);
pub const OBSERVER_SUBSCRIBER_CAPACITY: usize = 16;

// ============================================================================
// LOCAL CACHE TIER
// ============================================================================

pub const DEFAULT_LOCAL_CAPACITY: usize = 1000;
pub const DEFAULT_LOCAL_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
pub const NEGATIVE_AUTH_TTL: Duration = Duration::from_secs(30);
pub const HIT_RATIO_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// SCHEDULER AND MATCHER
// ============================================================================

pub const DEFAULT_NOTIFY_CONCURRENCY: usize = 500;
pub const DEFAULT_NOTIFY_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(200);
pub const DEFAULT_SUBSCRIBE_CATCH_UP: Duration = Duration::from_secs(3);
pub const DEFAULT_RETRY_QPS: u32 = 1;
pub const DEFAULT_RETRY_BURST: u32 = 1;
pub const DEFAULT_ACTOR_WORKERS: usize = 64;
pub const DEFAULT_IDLE_ACTOR_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_WATCH_CHANNEL_CAPACITY: usize = 64;

pub const DEFAULT_MATCHER_QPS: u32 = 300;
pub const DEFAULT_MATCHER_BURST: u32 = 300;
pub const DEFAULT_MATCHER_WAIT: Duration = Duration::from_millis(500);
