//! Typed local caches in front of the remote tier.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use trellis_core::{
    AppId, AppMeta, AsyncDownloadTask, BizId, Credential, ReleaseId, ReleasedConfigItem,
    ReleasedGroup, ReleasedHooks, ReleasedKv, TrellisError, TrellisResult,
};
use trellis_storage::CacheService;

use super::store::LocalStore;
use super::LocalKind;
use crate::config::ResourceCacheConfig;
use crate::telemetry::FeedMetrics;

// ============================================================================
// LOCAL RESOURCE TRAIT
// ============================================================================

/// A value the local tier caches, and how to fetch it from the remote tier.
#[async_trait]
pub trait LocalResource: DeserializeOwned + Clone + Send + Sync + 'static {
    type Key: Hash + Eq + Clone + Debug + Send + Sync + 'static;

    const KIND: LocalKind;

    /// Fetch the serialized value from the remote tier.
    async fn fetch(remote: &dyn CacheService, key: &Self::Key) -> TrellisResult<String>;
}

/// The id an app name resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ResolvedAppId(pub AppId);

#[async_trait]
impl LocalResource for AppMeta {
    type Key = (BizId, AppId);
    const KIND: LocalKind = LocalKind::AppMeta;

    async fn fetch(remote: &dyn CacheService, key: &Self::Key) -> TrellisResult<String> {
        remote.get_app_meta(key.0, key.1).await
    }
}

#[async_trait]
impl LocalResource for ResolvedAppId {
    type Key = (BizId, String);
    const KIND: LocalKind = LocalKind::AppId;

    async fn fetch(remote: &dyn CacheService, key: &Self::Key) -> TrellisResult<String> {
        remote.get_app_id(key.0, &key.1).await
    }
}

#[async_trait]
impl LocalResource for Vec<ReleasedConfigItem> {
    type Key = (BizId, ReleaseId);
    const KIND: LocalKind = LocalKind::ReleasedConfigItems;

    async fn fetch(remote: &dyn CacheService, key: &Self::Key) -> TrellisResult<String> {
        remote.get_released_config_items(key.0, key.1).await
    }
}

#[async_trait]
impl LocalResource for Vec<ReleasedKv> {
    type Key = (BizId, ReleaseId);
    const KIND: LocalKind = LocalKind::ReleasedKvs;

    async fn fetch(remote: &dyn CacheService, key: &Self::Key) -> TrellisResult<String> {
        remote.get_released_kvs(key.0, key.1).await
    }
}

#[async_trait]
impl LocalResource for ReleasedKv {
    type Key = (BizId, ReleaseId, String);
    const KIND: LocalKind = LocalKind::ReleasedKvValue;

    async fn fetch(remote: &dyn CacheService, key: &Self::Key) -> TrellisResult<String> {
        remote.get_released_kv_value(key.0, key.1, &key.2).await
    }
}

#[async_trait]
impl LocalResource for ReleasedHooks {
    type Key = (BizId, ReleaseId);
    const KIND: LocalKind = LocalKind::ReleasedHooks;

    async fn fetch(remote: &dyn CacheService, key: &Self::Key) -> TrellisResult<String> {
        remote.get_released_hooks(key.0, key.1).await
    }
}

#[async_trait]
impl LocalResource for Vec<ReleasedGroup> {
    type Key = (BizId, AppId);
    const KIND: LocalKind = LocalKind::ReleasedGroups;

    async fn fetch(remote: &dyn CacheService, key: &Self::Key) -> TrellisResult<String> {
        remote.list_released_groups(key.0, key.1).await
    }
}

#[async_trait]
impl LocalResource for Credential {
    type Key = (BizId, String);
    const KIND: LocalKind = LocalKind::Credential;

    async fn fetch(remote: &dyn CacheService, key: &Self::Key) -> TrellisResult<String> {
        remote.get_credential(key.0, &key.1).await
    }
}

#[async_trait]
impl LocalResource for AsyncDownloadTask {
    type Key = (BizId, String);
    const KIND: LocalKind = LocalKind::AsyncTask;

    async fn fetch(remote: &dyn CacheService, key: &Self::Key) -> TrellisResult<String> {
        remote.get_async_download_task(key.0, &key.1).await
    }
}

// ============================================================================
// RESOURCE CACHE
// ============================================================================

/// Local LRU for one resource type, filled from the remote tier on miss.
pub struct ResourceCache<R: LocalResource> {
    store: LocalStore<R::Key, R>,
    remote: Arc<dyn CacheService>,
    max_payload_bytes: usize,
}

impl<R: LocalResource> ResourceCache<R> {
    pub fn new(
        remote: Arc<dyn CacheService>,
        config: ResourceCacheConfig,
        metrics: FeedMetrics,
    ) -> Self {
        Self {
            store: LocalStore::new(R::KIND, config, metrics),
            remote,
            max_payload_bytes: config.max_payload_bytes,
        }
    }

    /// Return the cached value or fetch it from the remote tier.
    ///
    /// Remote and decode failures are counted and propagated without retry.
    /// Payloads at or above the size ceiling are returned but not admitted.
    pub async fn get(&self, key: &R::Key) -> TrellisResult<R> {
        if let Some(value) = self.store.lookup(key)? {
            return Ok(value);
        }

        let raw = match R::fetch(self.remote.as_ref(), key).await {
            Ok(raw) => raw,
            Err(e) => {
                self.store.record_error();
                return Err(e);
            }
        };
        let value: R = serde_json::from_str(&raw).map_err(|e| {
            self.store.record_error();
            TrellisError::codec(R::KIND.as_str(), e)
        })?;

        if raw.len() < self.max_payload_bytes {
            self.store.insert(key.clone(), value.clone())?;
        } else {
            tracing::debug!(
                resource = R::KIND.as_str(),
                key = ?key,
                bytes = raw.len(),
                "Payload above local ceiling, not cached"
            );
        }
        Ok(value)
    }

    /// Put a value the caller already holds.
    pub fn insert(&self, key: R::Key, value: R) -> TrellisResult<()> {
        self.store.insert(key, value)
    }

    pub fn invalidate(&self, key: &R::Key) -> TrellisResult<bool> {
        self.store.invalidate(key)
    }

    pub fn remove_where(&self, drop_if: impl Fn(&R::Key, &R) -> bool) -> TrellisResult<usize> {
        self.store.remove_where(drop_if)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn hit_ratio(&self) -> f64 {
        self.store.hit_ratio()
    }

    pub fn remote(&self) -> &Arc<dyn CacheService> {
        &self.remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;
    use std::time::Duration;
    use trellis_core::{ConfigType, StrategyMode};
    use trellis_storage::{
        InMemoryDurableStore, InMemorySource, RemoteCache, RemoteCacheConfig, RemoteCacheMetrics,
    };

    fn remote_with_app(app_id: AppId, memo: &str) -> Arc<dyn CacheService> {
        let registry = Registry::new();
        let source = InMemorySource::new();
        source.upsert_app(AppMeta {
            biz_id: 2,
            app_id,
            name: format!("app-{}", app_id),
            config_type: ConfigType::File,
            mode: StrategyMode::Normal,
            memo: memo.to_string(),
        })
        .unwrap();
        Arc::new(RemoteCache::new(
            Arc::new(InMemoryDurableStore::new()),
            Arc::new(source),
            &RemoteCacheConfig::default(),
            RemoteCacheMetrics::new(&registry).unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let metrics = FeedMetrics::new(&Registry::new()).unwrap();
        let cache: ResourceCache<AppMeta> = ResourceCache::new(
            remote_with_app(7, ""),
            ResourceCacheConfig::default(),
            metrics.clone(),
        );

        assert_eq!(cache.get(&(2, 7)).await.unwrap().app_id, 7);
        assert_eq!(cache.get(&(2, 7)).await.unwrap().app_id, 7);
        assert_eq!(metrics.lcache_hits_total.with_label_values(&["app_meta"]).get(), 1);
        assert_eq!(metrics.lcache_misses_total.with_label_values(&["app_meta"]).get(), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_counted_and_propagated() {
        let metrics = FeedMetrics::new(&Registry::new()).unwrap();
        let cache: ResourceCache<AppMeta> = ResourceCache::new(
            remote_with_app(7, ""),
            ResourceCacheConfig::default(),
            metrics.clone(),
        );

        let err = cache.get(&(2, 99)).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(metrics.lcache_errors_total.with_label_values(&["app_meta"]).get(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_payload_served_but_not_admitted() {
        let metrics = FeedMetrics::new(&Registry::new()).unwrap();
        let config = ResourceCacheConfig::new(16, Duration::from_secs(60), 32);
        let cache: ResourceCache<AppMeta> =
            ResourceCache::new(remote_with_app(7, &"x".repeat(64)), config, metrics);

        let meta = cache.get(&(2, 7)).await.unwrap();
        assert_eq!(meta.memo.len(), 64);
        assert!(cache.is_empty());
    }
}
