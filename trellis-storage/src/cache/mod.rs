//! Remote cache tier.
//!
//! A read-through cache in front of the source of record, shared by every
//! feed process through the durable store. Misses are refreshed under a
//! per-kind singleflight lock, absent records are cached as a `NullValue`
//! sentinel with a short randomized TTL, and every write draws its TTL from
//! the resource kind's range so that entries populated together expire apart.
//!
//! # Example
//!
//! ```ignore
//! let cache = RemoteCache::new(store, source, &RemoteCacheConfig::from_env(), metrics);
//! let raw = cache.get_app_meta(biz_id, app_id).await?;
//! let meta: AppMeta = serde_json::from_str(&raw)?;
//! ```

pub mod client;
pub mod config;
pub mod keys;
pub mod lock;
pub mod ttl;

pub use client::{CacheService, RemoteCache};
pub use config::RemoteCacheConfig;
pub use keys::CacheKey;
pub use lock::{LockState, ResourceLocks};
pub use ttl::TtlPolicy;
