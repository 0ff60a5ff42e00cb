//! Tenant-scoped durable store keys.
//!
//! Every key is prefixed with a `{biz_id}` hash tag so that all keys of one
//! tenant land on the same shard. `CacheKey` can only be built through its
//! constructors, each of which requires the tenant.

use std::fmt;
use trellis_core::constants::CACHE_KEY_HEAD;
use trellis_core::{AppId, BizId, ReleaseId, ResourceKind, StrategyId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    inner: CacheKeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKeyInner {
    biz_id: BizId,
    kind: ResourceKind,
    key: String,
}

impl CacheKey {
    fn new(biz_id: BizId, kind: ResourceKind, key: impl fmt::Display) -> Self {
        Self {
            inner: CacheKeyInner {
                biz_id,
                kind,
                key: key.to_string(),
            },
        }
    }

    pub fn app_meta(biz_id: BizId, app_id: AppId) -> Self {
        Self::new(biz_id, ResourceKind::AppMeta, app_id)
    }

    pub fn app_id(biz_id: BizId, app_name: &str) -> Self {
        Self::new(biz_id, ResourceKind::AppId, app_name)
    }

    pub fn released_config_items(biz_id: BizId, release_id: ReleaseId) -> Self {
        Self::new(biz_id, ResourceKind::ReleasedConfigItem, release_id)
    }

    pub fn released_kvs(biz_id: BizId, release_id: ReleaseId) -> Self {
        Self::new(biz_id, ResourceKind::ReleasedKv, release_id)
    }

    pub fn released_kv_value(biz_id: BizId, release_id: ReleaseId, key: &str) -> Self {
        Self::new(
            biz_id,
            ResourceKind::ReleasedKv,
            format_args!("{}:value:{}", release_id, key),
        )
    }

    pub fn released_hooks(biz_id: BizId, release_id: ReleaseId) -> Self {
        Self::new(biz_id, ResourceKind::ReleasedHook, release_id)
    }

    pub fn released_groups(biz_id: BizId, app_id: AppId) -> Self {
        Self::new(biz_id, ResourceKind::ReleasedGroup, app_id)
    }

    pub fn credential(biz_id: BizId, token: &str) -> Self {
        Self::new(biz_id, ResourceKind::Credential, token)
    }

    pub fn cps_ids(biz_id: BizId, app_id: AppId, namespace: &str) -> Self {
        if namespace.is_empty() {
            Self::new(biz_id, ResourceKind::CpsIds, app_id)
        } else {
            Self::new(
                biz_id,
                ResourceKind::CpsIds,
                format_args!("{}:ns:{}", app_id, namespace),
            )
        }
    }

    pub fn strategy(biz_id: BizId, strategy_id: StrategyId) -> Self {
        Self::new(biz_id, ResourceKind::Strategy, strategy_id)
    }

    pub fn instance_release(biz_id: BizId, app_id: AppId, uid: &str) -> Self {
        Self::new(
            biz_id,
            ResourceKind::InstanceRelease,
            format_args!("{}:{}", app_id, uid),
        )
    }

    pub fn async_download_task(biz_id: BizId, task_id: &str) -> Self {
        Self::new(biz_id, ResourceKind::AsyncDownloadTask, task_id)
    }

    pub fn client_metric(biz_id: BizId, app_id: AppId, uid: &str) -> Self {
        Self::new(
            biz_id,
            ResourceKind::ClientMetric,
            format_args!("{}:{}", app_id, uid),
        )
    }

    /// Glob pattern covering every key of `kind` whose key starts with `prefix`.
    pub fn pattern(biz_id: BizId, kind: ResourceKind, prefix: &str) -> String {
        format!(
            "{{{}}}{}:{}:{}*",
            biz_id,
            CACHE_KEY_HEAD,
            kind.namespace(),
            prefix
        )
    }

    pub fn biz_id(&self) -> BizId {
        self.inner.biz_id
    }

    pub fn kind(&self) -> ResourceKind {
        self.inner.kind
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Render as `{biz_id}trellis:<namespace>:<key>`.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}}}{}:{}:{}",
            self.inner.biz_id,
            CACHE_KEY_HEAD,
            self.inner.kind.namespace(),
            self.inner.key
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_carries_hash_tag() {
        let key = CacheKey::app_meta(2, 7);
        assert_eq!(key.render(), "{2}trellis:app-meta:7");
        assert_eq!(key.kind(), ResourceKind::AppMeta);
        assert_eq!(key.biz_id(), 2);
    }

    #[test]
    fn test_keys_of_one_tenant_share_prefix() {
        let a = CacheKey::strategy(9, 1).render();
        let b = CacheKey::instance_release(9, 3, "host-1").render();
        assert!(a.starts_with("{9}"));
        assert!(b.starts_with("{9}"));
        assert_eq!(b, "{9}trellis:instance-release:3:host-1");
    }

    #[test]
    fn test_namespace_scoped_cps_key() {
        assert_eq!(CacheKey::cps_ids(1, 5, "").render(), "{1}trellis:cps-id:5");
        assert_eq!(
            CacheKey::cps_ids(1, 5, "blue").render(),
            "{1}trellis:cps-id:5:ns:blue"
        );
    }

    #[test]
    fn test_pattern_matches_rendered_keys() {
        let pattern = CacheKey::pattern(4, ResourceKind::InstanceRelease, "3:");
        let glob = trellis_core::Glob::new(&pattern).unwrap();
        assert!(glob.is_match(&CacheKey::instance_release(4, 3, "a").render()));
        assert!(!glob.is_match(&CacheKey::instance_release(4, 31, "a").render()));
    }
}
