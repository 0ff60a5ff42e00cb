//! Source of record behind the remote cache tier.
//!
//! Lookups return `Ok(None)` when the record is absent; the cache turns that
//! into a negative entry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use trellis_core::{
    AppId, AppMeta, BizId, Credential, InstanceRelease, PublishedStrategy, ReleaseId,
    ReleasedConfigItem, ReleasedGroup, ReleasedHooks, ReleasedKv, StrategyId, TrellisError,
    TrellisResult,
};

#[async_trait]
pub trait SourceOfRecord: Send + Sync {
    async fn app_meta(&self, biz_id: BizId, app_id: AppId) -> TrellisResult<Option<AppMeta>>;

    async fn app_id(&self, biz_id: BizId, app_name: &str) -> TrellisResult<Option<AppId>>;

    async fn released_config_items(
        &self,
        biz_id: BizId,
        release_id: ReleaseId,
    ) -> TrellisResult<Option<Vec<ReleasedConfigItem>>>;

    async fn released_kvs(
        &self,
        biz_id: BizId,
        release_id: ReleaseId,
    ) -> TrellisResult<Option<Vec<ReleasedKv>>>;

    async fn released_hooks(
        &self,
        biz_id: BizId,
        release_id: ReleaseId,
    ) -> TrellisResult<Option<ReleasedHooks>>;

    async fn released_groups(
        &self,
        biz_id: BizId,
        app_id: AppId,
    ) -> TrellisResult<Option<Vec<ReleasedGroup>>>;

    async fn credential(&self, biz_id: BizId, token: &str) -> TrellisResult<Option<Credential>>;

    /// Ids of the currently published strategies of an app. With a namespace,
    /// only that namespace's strategies plus the default.
    async fn cps_ids(
        &self,
        biz_id: BizId,
        app_id: AppId,
        namespace: &str,
    ) -> TrellisResult<Option<Vec<StrategyId>>>;

    /// One page of strategies. Ids without a strategy are simply left out.
    async fn strategies(
        &self,
        biz_id: BizId,
        app_id: AppId,
        ids: &[StrategyId],
    ) -> TrellisResult<Vec<PublishedStrategy>>;

    async fn instance_release(
        &self,
        biz_id: BizId,
        app_id: AppId,
        uid: &str,
    ) -> TrellisResult<Option<InstanceRelease>>;
}

// ============================================================================
// SNAPSHOT-BACKED SOURCE
// ============================================================================

/// Content of one release.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseSnapshot {
    pub release_id: ReleaseId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config_items: Vec<ReleasedConfigItem>,
    #[serde(default)]
    pub kvs: Vec<ReleasedKv>,
    #[serde(default)]
    pub hooks: ReleasedHooks,
}

/// Everything the source knows about one app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSnapshot {
    pub meta: AppMeta,
    #[serde(default)]
    pub releases: Vec<ReleaseSnapshot>,
    #[serde(default)]
    pub strategies: Vec<PublishedStrategy>,
    #[serde(default)]
    pub groups: Vec<ReleasedGroup>,
    #[serde(default)]
    pub instance_releases: Vec<InstanceRelease>,
}

/// JSON document an [`InMemorySource`] can be loaded from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub apps: Vec<AppSnapshot>,
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

impl Snapshot {
    pub fn from_json(raw: &str) -> TrellisResult<Self> {
        serde_json::from_str(raw).map_err(|e| TrellisError::codec("snapshot", e))
    }

    pub fn load(path: &Path) -> TrellisResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TrellisError::InvalidParameter(format!("read {}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }
}

#[derive(Debug, Default)]
struct SourceState {
    apps: HashMap<(BizId, AppId), AppSnapshot>,
    releases: HashMap<(BizId, ReleaseId), ReleaseSnapshot>,
    credentials: HashMap<(BizId, String), Credential>,
}

/// Mutable in-memory source of record.
#[derive(Debug, Default)]
pub struct InMemorySource {
    state: RwLock<SourceState>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let source = Self::new();
        if let Ok(mut state) = source.state.write() {
            for app in snapshot.apps {
                let biz_id = app.meta.biz_id;
                for release in &app.releases {
                    state
                        .releases
                        .insert((biz_id, release.release_id), release.clone());
                }
                state.apps.insert((biz_id, app.meta.app_id), app);
            }
            for credential in snapshot.credentials {
                state
                    .credentials
                    .insert((credential.biz_id, credential.token.clone()), credential);
            }
        }
        source
    }

    fn read(&self) -> TrellisResult<std::sync::RwLockReadGuard<'_, SourceState>> {
        self.state
            .read()
            .map_err(|_| TrellisError::poisoned("in-memory-source"))
    }

    fn write(&self) -> TrellisResult<std::sync::RwLockWriteGuard<'_, SourceState>> {
        self.state
            .write()
            .map_err(|_| TrellisError::poisoned("in-memory-source"))
    }

    pub fn upsert_app(&self, meta: AppMeta) -> TrellisResult<()> {
        let mut state = self.write()?;
        let key = (meta.biz_id, meta.app_id);
        match state.apps.get_mut(&key) {
            Some(app) => app.meta = meta,
            None => {
                state.apps.insert(
                    key,
                    AppSnapshot {
                        meta,
                        releases: Vec::new(),
                        strategies: Vec::new(),
                        groups: Vec::new(),
                        instance_releases: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    pub fn remove_app(&self, biz_id: BizId, app_id: AppId) -> TrellisResult<()> {
        self.write()?.apps.remove(&(biz_id, app_id));
        Ok(())
    }

    pub fn add_release(&self, biz_id: BizId, release: ReleaseSnapshot) -> TrellisResult<()> {
        self.write()?
            .releases
            .insert((biz_id, release.release_id), release);
        Ok(())
    }

    /// Replace the published strategies of an app.
    pub fn publish(
        &self,
        biz_id: BizId,
        app_id: AppId,
        strategies: Vec<PublishedStrategy>,
    ) -> TrellisResult<()> {
        let mut state = self.write()?;
        let app = state.apps.get_mut(&(biz_id, app_id)).ok_or_else(|| {
            TrellisError::RecordNotFound(format!("app {} of biz {}", app_id, biz_id))
        })?;
        app.strategies = strategies;
        Ok(())
    }

    pub fn pin_instance(&self, pin: InstanceRelease) -> TrellisResult<()> {
        let mut state = self.write()?;
        let app = state
            .apps
            .get_mut(&(pin.biz_id, pin.app_id))
            .ok_or_else(|| TrellisError::RecordNotFound(format!("app {}", pin.app_id)))?;
        app.instance_releases.retain(|p| p.uid != pin.uid);
        app.instance_releases.push(pin);
        Ok(())
    }

    pub fn upsert_credential(&self, credential: Credential) -> TrellisResult<()> {
        self.write()?
            .credentials
            .insert((credential.biz_id, credential.token.clone()), credential);
        Ok(())
    }
}

#[async_trait]
impl SourceOfRecord for InMemorySource {
    async fn app_meta(&self, biz_id: BizId, app_id: AppId) -> TrellisResult<Option<AppMeta>> {
        Ok(self.read()?.apps.get(&(biz_id, app_id)).map(|a| a.meta.clone()))
    }

    async fn app_id(&self, biz_id: BizId, app_name: &str) -> TrellisResult<Option<AppId>> {
        Ok(self
            .read()?
            .apps
            .values()
            .find(|a| a.meta.biz_id == biz_id && a.meta.name == app_name)
            .map(|a| a.meta.app_id))
    }

    async fn released_config_items(
        &self,
        biz_id: BizId,
        release_id: ReleaseId,
    ) -> TrellisResult<Option<Vec<ReleasedConfigItem>>> {
        Ok(self
            .read()?
            .releases
            .get(&(biz_id, release_id))
            .map(|r| r.config_items.clone()))
    }

    async fn released_kvs(
        &self,
        biz_id: BizId,
        release_id: ReleaseId,
    ) -> TrellisResult<Option<Vec<ReleasedKv>>> {
        Ok(self
            .read()?
            .releases
            .get(&(biz_id, release_id))
            .map(|r| r.kvs.clone()))
    }

    async fn released_hooks(
        &self,
        biz_id: BizId,
        release_id: ReleaseId,
    ) -> TrellisResult<Option<ReleasedHooks>> {
        Ok(self
            .read()?
            .releases
            .get(&(biz_id, release_id))
            .map(|r| r.hooks.clone()))
    }

    async fn released_groups(
        &self,
        biz_id: BizId,
        app_id: AppId,
    ) -> TrellisResult<Option<Vec<ReleasedGroup>>> {
        Ok(self
            .read()?
            .apps
            .get(&(biz_id, app_id))
            .map(|a| a.groups.clone()))
    }

    async fn credential(&self, biz_id: BizId, token: &str) -> TrellisResult<Option<Credential>> {
        Ok(self
            .read()?
            .credentials
            .get(&(biz_id, token.to_string()))
            .cloned())
    }

    async fn cps_ids(
        &self,
        biz_id: BizId,
        app_id: AppId,
        namespace: &str,
    ) -> TrellisResult<Option<Vec<StrategyId>>> {
        let state = self.read()?;
        let Some(app) = state.apps.get(&(biz_id, app_id)) else {
            return Ok(None);
        };
        let mut ids: Vec<StrategyId> = app
            .strategies
            .iter()
            .filter(|s| namespace.is_empty() || s.as_default || s.namespace == namespace)
            .map(|s| s.strategy_id)
            .collect();
        ids.sort_unstable();
        Ok(Some(ids))
    }

    async fn strategies(
        &self,
        biz_id: BizId,
        app_id: AppId,
        ids: &[StrategyId],
    ) -> TrellisResult<Vec<PublishedStrategy>> {
        let state = self.read()?;
        Ok(state
            .apps
            .get(&(biz_id, app_id))
            .map(|app| {
                app.strategies
                    .iter()
                    .filter(|s| ids.contains(&s.strategy_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn instance_release(
        &self,
        biz_id: BizId,
        app_id: AppId,
        uid: &str,
    ) -> TrellisResult<Option<InstanceRelease>> {
        Ok(self.read()?.apps.get(&(biz_id, app_id)).and_then(|app| {
            app.instance_releases
                .iter()
                .find(|p| p.uid == uid)
                .cloned()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::{ConfigType, StrategyMode, StrategyScope};

    fn strategy(id: StrategyId, release: ReleaseId, as_default: bool, ns: &str) -> PublishedStrategy {
        PublishedStrategy {
            strategy_id: id,
            app_id: 7,
            release_id: release,
            as_default,
            mode: StrategyMode::Namespace,
            namespace: ns.to_string(),
            scope: StrategyScope::default(),
        }
    }

    fn source() -> InMemorySource {
        let raw = r#"{
            "apps": [{
                "meta": {"biz_id": 2, "app_id": 7, "name": "payment", "config_type": "kv", "mode": "namespace"},
                "releases": [{"release_id": 10, "kvs": [{"release_id": 10, "key": "timeout", "kv_type": "number", "value": "30", "signature": "s"}]}]
            }]
        }"#;
        InMemorySource::from_snapshot(Snapshot::from_json(raw).unwrap())
    }

    #[tokio::test]
    async fn test_snapshot_lookups() {
        let source = source();
        let meta = source.app_meta(2, 7).await.unwrap().unwrap();
        assert_eq!(meta.config_type, ConfigType::Kv);
        assert_eq!(source.app_id(2, "payment").await.unwrap(), Some(7));
        assert_eq!(source.app_id(3, "payment").await.unwrap(), None);
        assert_eq!(source.released_kvs(2, 10).await.unwrap().unwrap().len(), 1);
        assert!(source.released_kvs(2, 11).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cps_ids_filter_by_namespace() {
        let source = source();
        source
            .publish(
                2,
                7,
                vec![
                    strategy(1, 10, true, ""),
                    strategy(2, 11, false, "blue"),
                    strategy(3, 12, false, "green"),
                ],
            )
            .unwrap();
        assert_eq!(source.cps_ids(2, 7, "").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(source.cps_ids(2, 7, "blue").await.unwrap(), Some(vec![1, 2]));
        let page = source.strategies(2, 7, &[3, 99]).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].release_id, 12);
    }
}
