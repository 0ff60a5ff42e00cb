//! Trellis Feed - Local Cache Tier, Release Matching and Watch Fanout
//!
//! The feed process sits between sidecars and the shared remote cache. It
//! keeps a per-resource LRU tier in front of the remote tier, resolves which
//! release each instance should run, and pushes release changes to every
//! watching instance after the change observer has purged stale cache keys.

pub mod config;
pub mod error;
pub mod lcache;
pub mod matcher;
pub mod purger;
pub mod stream;
pub mod telemetry;
pub mod watch;
pub mod ws;

pub use config::{FeedConfig, LocalCacheConfig, MatcherConfig, ResourceCacheConfig, SchedulerConfig};
pub use error::{ApiError, ApiResult};
pub use lcache::{LocalCaches, LocalKind};
pub use matcher::{evaluate, ReleaseMatcher};
pub use purger::FeedPurger;
pub use stream::{
    CommittedCursor, FeedMessage, Member, MessageBody, NotifyOutcome, PayloadBuilder,
    ReleaseContent, ReleasePayload, ReleaseReceiver, RetryEntry, RetryQueue, Scheduler,
};
pub use telemetry::{init_tracing, FeedMetrics, TelemetryConfig};
pub use watch::{MessageSink, SubscribeRequest, WatchHub};
pub use ws::{router, AppState};
