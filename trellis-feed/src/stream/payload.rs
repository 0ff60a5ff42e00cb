//! Builds the release payload sent to one member.

use std::sync::Arc;
use trellis_core::{
    ConfigType, EventId, GlobSet, InstanceSpec, ReleaseId, ReleasedHooks, TrellisResult,
};

use super::messages::{ConfigItemMeta, KvMeta, ReleaseContent, ReleasePayload, RepositoryLocation};
use crate::lcache::LocalCaches;

pub struct PayloadBuilder {
    caches: Arc<LocalCaches>,
    repository_root: String,
}

impl PayloadBuilder {
    pub fn new(caches: Arc<LocalCaches>, repository_root: impl Into<String>) -> Self {
        Self {
            caches,
            repository_root: repository_root.into(),
        }
    }

    /// Release metadata for `spec`, filtered by its match patterns.
    pub async fn build(
        &self,
        spec: &InstanceSpec,
        release_id: ReleaseId,
        cursor: EventId,
    ) -> TrellisResult<ReleasePayload> {
        let patterns = GlobSet::new(&spec.match_patterns)?;
        let key = (spec.biz_id, release_id);

        let content = match spec.config_type {
            ConfigType::File => {
                let items = self.caches.config_items.get(&key).await?;
                let hooks = match self.caches.hooks.get(&key).await {
                    Ok(hooks) => hooks,
                    Err(e) if e.is_not_found() => ReleasedHooks::default(),
                    Err(e) => return Err(e),
                };
                ReleaseContent::File {
                    repository: RepositoryLocation::new(
                        &self.repository_root,
                        spec.biz_id,
                        spec.app_id,
                        release_id,
                    ),
                    items: items
                        .iter()
                        .filter(|item| patterns.is_match(&item.full_path()))
                        .map(ConfigItemMeta::from)
                        .collect(),
                    pre_hook: hooks.pre,
                    post_hook: hooks.post,
                }
            }
            ConfigType::Kv => {
                let kvs = self.caches.kvs.get(&key).await?;
                ReleaseContent::Kv {
                    keys: kvs
                        .iter()
                        .filter(|kv| patterns.is_match(&kv.key))
                        .map(KvMeta::from)
                        .collect(),
                }
            }
        };

        Ok(ReleasePayload {
            biz_id: spec.biz_id,
            app_id: spec.app_id,
            app: spec.app.clone(),
            release_id,
            cursor_id: cursor,
            content,
        })
    }
}
