//! Local Cache Tier
//!
//! One independently sized LRU per resource type in front of the remote
//! tier. Entries are dropped by event-driven purges and by TTL; released
//! content is immutable and only ages out.

mod auth;
mod resource;
mod sampler;
mod store;
mod task;

pub use auth::{AuthCache, CredentialAuthorizer};
pub use resource::{LocalResource, ResolvedAppId, ResourceCache};
pub use sampler::run_hit_ratio_sampler;
pub use store::LocalStore;
pub use task::{AsyncTaskCache, ClientMetricSink};

use std::fmt;
use std::sync::Arc;
use trellis_core::{
    AppMeta, Credential, EventMeta, InstanceSpec, ReleasedConfigItem, ReleasedGroup,
    ReleasedHooks, ReleasedKv, ResourceType, TrellisResult,
};
use trellis_storage::CacheService;

use crate::config::LocalCacheConfig;
use crate::telemetry::FeedMetrics;

/// The resource types cached locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalKind {
    AppMeta,
    AppId,
    ReleasedConfigItems,
    ReleasedKvs,
    ReleasedKvValue,
    ReleasedHooks,
    ReleasedGroups,
    Credential,
    Authorization,
    AsyncTask,
}

impl LocalKind {
    pub const ALL: [LocalKind; 10] = [
        LocalKind::AppMeta,
        LocalKind::AppId,
        LocalKind::ReleasedConfigItems,
        LocalKind::ReleasedKvs,
        LocalKind::ReleasedKvValue,
        LocalKind::ReleasedHooks,
        LocalKind::ReleasedGroups,
        LocalKind::Credential,
        LocalKind::Authorization,
        LocalKind::AsyncTask,
    ];

    /// Metric label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalKind::AppMeta => "app_meta",
            LocalKind::AppId => "app_id",
            LocalKind::ReleasedConfigItems => "released_config_items",
            LocalKind::ReleasedKvs => "released_kvs",
            LocalKind::ReleasedKvValue => "released_kv_value",
            LocalKind::ReleasedHooks => "released_hooks",
            LocalKind::ReleasedGroups => "released_groups",
            LocalKind::Credential => "credential",
            LocalKind::Authorization => "authorization",
            LocalKind::AsyncTask => "async_task",
        }
    }

    /// Segment used in `TRELLIS_LCACHE_<KIND>_*` variables.
    pub fn env_name(&self) -> String {
        self.as_str().to_ascii_uppercase()
    }
}

impl fmt::Display for LocalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// LOCAL CACHES
// ============================================================================

/// Every local cache of the feed process.
pub struct LocalCaches {
    pub app_meta: ResourceCache<AppMeta>,
    pub app_id: ResourceCache<ResolvedAppId>,
    pub config_items: ResourceCache<Vec<ReleasedConfigItem>>,
    pub kvs: ResourceCache<Vec<ReleasedKv>>,
    pub kv_value: ResourceCache<ReleasedKv>,
    pub hooks: ResourceCache<ReleasedHooks>,
    pub groups: ResourceCache<Vec<ReleasedGroup>>,
    pub credentials: Arc<ResourceCache<Credential>>,
    pub auth: AuthCache,
    pub tasks: AsyncTaskCache,
    pub client_metrics: ClientMetricSink,
    metrics: FeedMetrics,
}

impl LocalCaches {
    pub fn new(
        remote: Arc<dyn CacheService>,
        config: &LocalCacheConfig,
        metrics: FeedMetrics,
    ) -> Self {
        let credentials = Arc::new(ResourceCache::new(
            remote.clone(),
            config.resource(LocalKind::Credential),
            metrics.clone(),
        ));
        Self {
            app_meta: Self::cache(&remote, config, &metrics),
            app_id: Self::cache(&remote, config, &metrics),
            config_items: Self::cache(&remote, config, &metrics),
            kvs: Self::cache(&remote, config, &metrics),
            kv_value: Self::cache(&remote, config, &metrics),
            hooks: Self::cache(&remote, config, &metrics),
            groups: Self::cache(&remote, config, &metrics),
            auth: AuthCache::new(credentials.clone(), config, metrics.clone()),
            credentials,
            tasks: AsyncTaskCache::new(Self::cache(&remote, config, &metrics)),
            client_metrics: ClientMetricSink::new(remote),
            metrics,
        }
    }

    fn cache<R: LocalResource>(
        remote: &Arc<dyn CacheService>,
        config: &LocalCacheConfig,
        metrics: &FeedMetrics,
    ) -> ResourceCache<R> {
        ResourceCache::new(remote.clone(), config.resource(R::KIND), metrics.clone())
    }

    /// Whether `token` may watch the app `spec` asks for.
    ///
    /// The credential must grant the app name, and the name must resolve to
    /// the app id the instance subscribes with.
    pub async fn authorize_watch(&self, token: &str, spec: &InstanceSpec) -> TrellisResult<bool> {
        if !self.auth.authorize(spec.biz_id, token, &spec.app).await? {
            return Ok(false);
        }
        match self.app_id.get(&(spec.biz_id, spec.app.clone())).await {
            Ok(resolved) if resolved.0 == spec.app_id => Ok(true),
            Ok(resolved) => {
                tracing::info!(
                    biz_id = spec.biz_id,
                    app = %spec.app,
                    app_id = spec.app_id,
                    resolved = resolved.0,
                    "App name does not match app id"
                );
                Ok(false)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drop local entries made stale by `events`. Returns how many went.
    ///
    /// Released content is immutable and never purged here.
    pub fn purge(&self, events: &[EventMeta]) -> TrellisResult<usize> {
        let mut removed = 0;
        for event in events {
            let biz_id = event.attachment.biz_id;
            let app_id = event.attachment.app_id;
            match event.spec.resource {
                ResourceType::Application => {
                    removed += usize::from(self.app_meta.invalidate(&(biz_id, app_id))?);
                    removed += self
                        .app_id
                        .remove_where(|(biz, _), id| *biz == biz_id && id.0 == app_id)?;
                    removed += usize::from(self.groups.invalidate(&(biz_id, app_id))?);
                }
                ResourceType::Publish => {
                    removed += usize::from(self.groups.invalidate(&(biz_id, app_id))?);
                }
                ResourceType::Credential => {
                    removed += self.credentials.remove_where(|(biz, _), _| *biz == biz_id)?;
                    removed += self.auth.forget_biz(biz_id)?;
                }
                ResourceType::InstancePublish => {}
            }
        }
        if removed > 0 {
            tracing::debug!(events = events.len(), removed, "Local caches purged");
        }
        Ok(removed)
    }

    pub fn hit_ratios(&self) -> Vec<(LocalKind, f64)> {
        vec![
            (LocalKind::AppMeta, self.app_meta.hit_ratio()),
            (LocalKind::AppId, self.app_id.hit_ratio()),
            (LocalKind::ReleasedConfigItems, self.config_items.hit_ratio()),
            (LocalKind::ReleasedKvs, self.kvs.hit_ratio()),
            (LocalKind::ReleasedKvValue, self.kv_value.hit_ratio()),
            (LocalKind::ReleasedHooks, self.hooks.hit_ratio()),
            (LocalKind::ReleasedGroups, self.groups.hit_ratio()),
            (LocalKind::Credential, self.credentials.hit_ratio()),
            (LocalKind::Authorization, self.auth.hit_ratio()),
            (LocalKind::AsyncTask, self.tasks.hit_ratio()),
        ]
    }

    pub fn export_hit_ratios(&self) {
        for (kind, ratio) in self.hit_ratios() {
            self.metrics
                .lcache_hit_ratio
                .with_label_values(&[kind.as_str()])
                .set(ratio);
        }
    }
}
