//! Trellis Storage - Remote Cache Tier
//!
//! Durable store abstraction, the stampede-resistant read-through cache in
//! front of the source of record, and event-driven remote invalidation.

pub mod cache;
pub mod limiter;
pub mod metrics;
pub mod purge;
pub mod source;
pub mod store;

pub use cache::{
    CacheKey, CacheService, LockState, RemoteCache, RemoteCacheConfig, ResourceLocks, TtlPolicy,
};
pub use limiter::{direct_limiter, wait_permit, DirectRateLimiter};
pub use metrics::RemoteCacheMetrics;
pub use purge::{PublishIndex, RemotePurger};
pub use source::{AppSnapshot, InMemorySource, ReleaseSnapshot, Snapshot, SourceOfRecord};
#[cfg(feature = "redis")]
pub use store::RedisDurableStore;
pub use store::{DurableStore, InMemoryDurableStore, StoreEntry};
