//! Read-through remote cache client.
//!
//! Every getter returns the cached JSON payload as stored. Decoding is left
//! to the caller so that the local tier can bound what it admits by size.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use trellis_core::constants::NULL_VALUE;
use trellis_core::{
    AppId, AsyncDownloadTask, BizId, ClientMetric, PublishedStrategy, ReleaseId, ResourceKind,
    StrategyId, TrellisError, TrellisResult,
};

use super::config::RemoteCacheConfig;
use super::keys::CacheKey;
use super::lock::ResourceLocks;
use super::ttl::TtlPolicy;
use crate::metrics::RemoteCacheMetrics;
use crate::source::SourceOfRecord;
use crate::store::{DurableStore, StoreEntry};

/// The remote cache tier as seen by its clients.
#[async_trait]
pub trait CacheService: Send + Sync {
    async fn get_app_meta(&self, biz_id: BizId, app_id: AppId) -> TrellisResult<String>;

    async fn get_app_id(&self, biz_id: BizId, app_name: &str) -> TrellisResult<String>;

    async fn get_released_config_items(
        &self,
        biz_id: BizId,
        release_id: ReleaseId,
    ) -> TrellisResult<String>;

    async fn get_released_kvs(&self, biz_id: BizId, release_id: ReleaseId) -> TrellisResult<String>;

    async fn get_released_kv_value(
        &self,
        biz_id: BizId,
        release_id: ReleaseId,
        key: &str,
    ) -> TrellisResult<String>;

    async fn get_released_hooks(&self, biz_id: BizId, release_id: ReleaseId)
        -> TrellisResult<String>;

    async fn list_released_groups(&self, biz_id: BizId, app_id: AppId) -> TrellisResult<String>;

    async fn get_credential(&self, biz_id: BizId, token: &str) -> TrellisResult<String>;

    /// JSON array of currently published strategy ids.
    async fn get_app_cps_ids(
        &self,
        biz_id: BizId,
        app_id: AppId,
        namespace: &str,
    ) -> TrellisResult<String>;

    /// JSON array of strategies in the order of `ids`.
    async fn get_published_strategies(
        &self,
        biz_id: BizId,
        app_id: AppId,
        ids: &[StrategyId],
    ) -> TrellisResult<String>;

    async fn get_instance_release(
        &self,
        biz_id: BizId,
        app_id: AppId,
        uid: &str,
    ) -> TrellisResult<String>;

    async fn get_async_download_task(&self, biz_id: BizId, task_id: &str) -> TrellisResult<String>;

    async fn set_async_download_task(&self, task: &AsyncDownloadTask) -> TrellisResult<()>;

    async fn set_client_metric(&self, metric: &ClientMetric) -> TrellisResult<()>;
}

fn encode<T: Serialize>(kind: ResourceKind, value: &T) -> TrellisResult<String> {
    serde_json::to_string(value).map_err(|e| TrellisError::codec(kind.namespace(), e))
}

/// Stampede-resistant read-through cache over a durable store.
pub struct RemoteCache {
    store: Arc<dyn DurableStore>,
    source: Arc<dyn SourceOfRecord>,
    locks: ResourceLocks,
    ttl: TtlPolicy,
    metrics: RemoteCacheMetrics,
    strategy_page_size: usize,
}

impl RemoteCache {
    pub fn new(
        store: Arc<dyn DurableStore>,
        source: Arc<dyn SourceOfRecord>,
        config: &RemoteCacheConfig,
        metrics: RemoteCacheMetrics,
    ) -> Self {
        Self {
            store,
            source,
            locks: ResourceLocks::new(config, metrics.clone()),
            ttl: TtlPolicy::new(config),
            metrics,
            strategy_page_size: config.strategy_page_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    pub fn metrics(&self) -> &RemoteCacheMetrics {
        &self.metrics
    }

    pub fn locks(&self) -> &ResourceLocks {
        &self.locks
    }

    /// Interpret a raw stored value.
    fn cached(&self, key: &CacheKey, raw: String) -> TrellisResult<String> {
        if raw == NULL_VALUE {
            self.metrics.record_read(key.kind(), "null");
            return Err(TrellisError::RecordNotFound(key.render()));
        }
        self.metrics.record_read(key.kind(), "hit");
        Ok(raw)
    }

    /// Read `key`, refreshing it from `fetch` on a miss.
    async fn read_through<T, F, Fut>(&self, key: CacheKey, fetch: F) -> TrellisResult<String>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = TrellisResult<Option<T>>>,
    {
        let rendered = key.render();
        if let Some(raw) = self.store.get(&rendered).await? {
            return self.cached(&key, raw);
        }
        self.metrics.record_read(key.kind(), "miss");

        let mut state = self.locks.acquire(key.kind(), &rendered).await?;
        if !state.should_refresh() {
            state.wait_holder(self.locks.wait()).await;
            return match self.store.get(&rendered).await? {
                Some(raw) => self.cached(&key, raw),
                None => {
                    self.metrics.inconsistent_total.inc();
                    Err(TrellisError::Inconsistent(format!(
                        "{} was not populated by the refresh holder",
                        rendered
                    )))
                }
            };
        }

        // The previous holder may have populated the key while we queued
        if state.acquired() {
            if let Some(raw) = self.store.get(&rendered).await? {
                self.locks.release(state, true);
                return self.cached(&key, raw);
            }
        }

        let outcome = self.refresh(&key, &rendered, fetch).await;
        let success = match &outcome {
            Ok(_) => true,
            Err(e) => e.is_not_found(),
        };
        self.locks.release(state, success);
        outcome
    }

    async fn refresh<T, F, Fut>(&self, key: &CacheKey, rendered: &str, fetch: F) -> TrellisResult<String>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = TrellisResult<Option<T>>>,
    {
        match fetch().await? {
            Some(value) => {
                let raw = encode(key.kind(), &value)?;
                self.store
                    .set(rendered, &raw, self.ttl.ttl(key.kind()))
                    .await?;
                Ok(raw)
            }
            None => {
                self.write_null(key.kind(), rendered).await?;
                Err(TrellisError::RecordNotFound(rendered.to_string()))
            }
        }
    }

    async fn write_null(&self, kind: ResourceKind, rendered: &str) -> TrellisResult<()> {
        self.store
            .set(rendered, NULL_VALUE, self.ttl.null_ttl())
            .await?;
        self.metrics
            .null_writes_total
            .with_label_values(&[kind.namespace()])
            .inc();
        tracing::debug!(kind = %kind, key = %rendered, "cached negative entry");
        Ok(())
    }

    /// Load missing strategies page by page and write them in one atomic batch.
    async fn refresh_strategies(
        &self,
        biz_id: BizId,
        app_id: AppId,
        missing: &[StrategyId],
    ) -> TrellisResult<Vec<PublishedStrategy>> {
        let mut found = Vec::with_capacity(missing.len());
        for page in missing.chunks(self.strategy_page_size) {
            found.extend(self.source.strategies(biz_id, app_id, page).await?);
        }

        let entries = found
            .iter()
            .map(|s| {
                Ok(StoreEntry::new(
                    CacheKey::strategy(biz_id, s.strategy_id).render(),
                    encode(ResourceKind::Strategy, s)?,
                    self.ttl.ttl(ResourceKind::Strategy),
                ))
            })
            .collect::<TrellisResult<Vec<_>>>()?;
        self.store.mset(&entries).await?;

        let absent: Vec<StrategyId> = missing
            .iter()
            .copied()
            .filter(|id| !found.iter().any(|s| s.strategy_id == *id))
            .collect();
        for id in &absent {
            self.write_null(ResourceKind::Strategy, &CacheKey::strategy(biz_id, *id).render())
                .await?;
        }
        if !absent.is_empty() {
            self.metrics.inconsistent_total.inc();
            tracing::warn!(
                biz_id,
                app_id,
                absent = ?absent,
                "published strategies missing from source of record"
            );
            return Err(TrellisError::Inconsistent(format!(
                "strategies {:?} of app {} are not published yet",
                absent, app_id
            )));
        }
        Ok(found)
    }

    /// Cached strategies for `ids`, `None` where the key is absent.
    async fn cached_strategies(
        &self,
        biz_id: BizId,
        ids: &[StrategyId],
    ) -> TrellisResult<Vec<Option<PublishedStrategy>>> {
        let keys: Vec<String> = ids
            .iter()
            .map(|id| CacheKey::strategy(biz_id, *id).render())
            .collect();
        let raws = self.store.mget(&keys).await?;
        raws.into_iter()
            .zip(ids)
            .map(|(raw, id)| match raw {
                None => Ok(None),
                Some(raw) if raw == NULL_VALUE => {
                    self.metrics.inconsistent_total.inc();
                    Err(TrellisError::Inconsistent(format!(
                        "strategy {} is cached as absent",
                        id
                    )))
                }
                Some(raw) => serde_json::from_str(&raw)
                    .map(Some)
                    .map_err(|e| TrellisError::codec("strategy", e)),
            })
            .collect()
    }
}

#[async_trait]
impl CacheService for RemoteCache {
    async fn get_app_meta(&self, biz_id: BizId, app_id: AppId) -> TrellisResult<String> {
        self.read_through(CacheKey::app_meta(biz_id, app_id), || {
            self.source.app_meta(biz_id, app_id)
        })
        .await
    }

    async fn get_app_id(&self, biz_id: BizId, app_name: &str) -> TrellisResult<String> {
        if app_name.is_empty() {
            return Err(TrellisError::InvalidParameter("app name is empty".into()));
        }
        self.read_through(CacheKey::app_id(biz_id, app_name), || {
            self.source.app_id(biz_id, app_name)
        })
        .await
    }

    async fn get_released_config_items(
        &self,
        biz_id: BizId,
        release_id: ReleaseId,
    ) -> TrellisResult<String> {
        self.read_through(CacheKey::released_config_items(biz_id, release_id), || {
            self.source.released_config_items(biz_id, release_id)
        })
        .await
    }

    async fn get_released_kvs(&self, biz_id: BizId, release_id: ReleaseId) -> TrellisResult<String> {
        self.read_through(CacheKey::released_kvs(biz_id, release_id), || {
            self.source.released_kvs(biz_id, release_id)
        })
        .await
    }

    async fn get_released_kv_value(
        &self,
        biz_id: BizId,
        release_id: ReleaseId,
        key: &str,
    ) -> TrellisResult<String> {
        self.read_through(
            CacheKey::released_kv_value(biz_id, release_id, key),
            || async move {
                Ok(self
                    .source
                    .released_kvs(biz_id, release_id)
                    .await?
                    .and_then(|kvs| kvs.into_iter().find(|kv| kv.key == key)))
            },
        )
        .await
    }

    async fn get_released_hooks(
        &self,
        biz_id: BizId,
        release_id: ReleaseId,
    ) -> TrellisResult<String> {
        self.read_through(CacheKey::released_hooks(biz_id, release_id), || {
            self.source.released_hooks(biz_id, release_id)
        })
        .await
    }

    async fn list_released_groups(&self, biz_id: BizId, app_id: AppId) -> TrellisResult<String> {
        self.read_through(CacheKey::released_groups(biz_id, app_id), || {
            self.source.released_groups(biz_id, app_id)
        })
        .await
    }

    async fn get_credential(&self, biz_id: BizId, token: &str) -> TrellisResult<String> {
        if token.is_empty() {
            return Err(TrellisError::InvalidParameter("credential token is empty".into()));
        }
        self.read_through(CacheKey::credential(biz_id, token), || {
            self.source.credential(biz_id, token)
        })
        .await
    }

    async fn get_app_cps_ids(
        &self,
        biz_id: BizId,
        app_id: AppId,
        namespace: &str,
    ) -> TrellisResult<String> {
        self.read_through(CacheKey::cps_ids(biz_id, app_id, namespace), || {
            self.source.cps_ids(biz_id, app_id, namespace)
        })
        .await
    }

    async fn get_published_strategies(
        &self,
        biz_id: BizId,
        app_id: AppId,
        ids: &[StrategyId],
    ) -> TrellisResult<String> {
        if ids.is_empty() {
            return Ok("[]".to_string());
        }

        let mut slots = self.cached_strategies(biz_id, ids).await?;
        let missing: Vec<StrategyId> = ids
            .iter()
            .zip(&slots)
            .filter(|(_, slot)| slot.is_none())
            .map(|(id, _)| *id)
            .collect();

        if missing.is_empty() {
            self.metrics.record_read(ResourceKind::Strategy, "hit");
        } else {
            self.metrics.record_read(ResourceKind::Strategy, "miss");
            let lock_key = format!("{}:{}:{:?}", biz_id, app_id, missing);
            let mut state = self.locks.acquire(ResourceKind::Strategy, &lock_key).await?;

            if state.should_refresh() {
                let refreshed = self.refresh_strategies(biz_id, app_id, &missing).await;
                self.locks.release(state, refreshed.is_ok());
                let refreshed = refreshed?;
                for (id, slot) in ids.iter().zip(slots.iter_mut()) {
                    if slot.is_none() {
                        *slot = refreshed.iter().find(|s| s.strategy_id == *id).cloned();
                    }
                }
            } else {
                state.wait_holder(self.locks.wait()).await;
                slots = self.cached_strategies(biz_id, ids).await?;
            }
        }

        let strategies = slots
            .into_iter()
            .collect::<Option<Vec<PublishedStrategy>>>()
            .ok_or_else(|| {
                self.metrics.inconsistent_total.inc();
                TrellisError::Inconsistent(format!(
                    "strategies of app {} were not populated in time",
                    app_id
                ))
            })?;
        encode(ResourceKind::Strategy, &strategies)
    }

    async fn get_instance_release(
        &self,
        biz_id: BizId,
        app_id: AppId,
        uid: &str,
    ) -> TrellisResult<String> {
        self.read_through(CacheKey::instance_release(biz_id, app_id, uid), || {
            self.source.instance_release(biz_id, app_id, uid)
        })
        .await
    }

    async fn get_async_download_task(&self, biz_id: BizId, task_id: &str) -> TrellisResult<String> {
        let key = CacheKey::async_download_task(biz_id, task_id);
        match self.store.get(&key.render()).await? {
            Some(raw) => self.cached(&key, raw),
            None => {
                self.metrics.record_read(key.kind(), "miss");
                Err(TrellisError::RecordNotFound(key.render()))
            }
        }
    }

    async fn set_async_download_task(&self, task: &AsyncDownloadTask) -> TrellisResult<()> {
        let key = CacheKey::async_download_task(task.biz_id, &task.task_id);
        let raw = encode(key.kind(), task)?;
        self.store
            .set(&key.render(), &raw, self.ttl.ttl(key.kind()))
            .await
    }

    async fn set_client_metric(&self, metric: &ClientMetric) -> TrellisResult<()> {
        let key = CacheKey::client_metric(metric.biz_id, metric.app_id, &metric.uid);
        let raw = encode(key.kind(), metric)?;
        self.store
            .set(&key.render(), &raw, self.ttl.ttl(key.kind()))
            .await
    }
}
