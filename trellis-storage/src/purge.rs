//! Remote-tier invalidation driven by change events.

use std::sync::Arc;

use trellis_core::constants::CACHE_KEY_HEAD;
use trellis_core::{
    AppId, BizId, EventMeta, OpType, ReleaseId, ResourceKind, ResourceType, Timestamp,
    TrellisResult,
};

use crate::cache::CacheKey;
use crate::store::DurableStore;

/// Deletes remote cache keys an event batch makes stale.
///
/// Released content is immutable and keyed by release id, so it is never
/// purged; only the pointers to it are.
pub struct RemotePurger {
    store: Arc<dyn DurableStore>,
    index: PublishIndex,
}

impl RemotePurger {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            index: PublishIndex::new(Arc::clone(&store)),
            store,
        }
    }

    pub fn index(&self) -> &PublishIndex {
        &self.index
    }

    /// Keys and key patterns made stale by one event.
    fn stale_keys(event: &EventMeta) -> (Vec<String>, Vec<String>) {
        let biz = event.attachment.biz_id;
        let app = event.attachment.app_id;
        let app_prefix = app.to_string();
        let app_scoped = format!("{}:", app);
        match event.spec.resource {
            ResourceType::Application => (
                vec![
                    CacheKey::app_meta(biz, app).render(),
                    CacheKey::cps_ids(biz, app, "").render(),
                    CacheKey::released_groups(biz, app).render(),
                ],
                vec![
                    // app-id keys are keyed by name, which the event does not carry
                    CacheKey::pattern(biz, ResourceKind::AppId, ""),
                    CacheKey::pattern(biz, ResourceKind::CpsIds, &format!("{}:ns:", app_prefix)),
                    CacheKey::pattern(biz, ResourceKind::InstanceRelease, &app_scoped),
                ],
            ),
            ResourceType::Publish => (
                vec![
                    CacheKey::cps_ids(biz, app, "").render(),
                    CacheKey::released_groups(biz, app).render(),
                ],
                vec![CacheKey::pattern(
                    biz,
                    ResourceKind::CpsIds,
                    &format!("{}:ns:", app_prefix),
                )],
            ),
            ResourceType::Credential => (
                Vec::new(),
                vec![CacheKey::pattern(biz, ResourceKind::Credential, "")],
            ),
            ResourceType::InstancePublish => (
                Vec::new(),
                vec![CacheKey::pattern(biz, ResourceKind::InstanceRelease, &app_scoped)],
            ),
        }
    }

    /// Purge the remote keys made stale by `events` and index publishes.
    pub async fn purge(&self, events: &[EventMeta]) -> TrellisResult<u64> {
        let mut removed = 0;
        for event in events {
            let (mut keys, patterns) = Self::stale_keys(event);
            for pattern in &patterns {
                keys.extend(self.store.keys(pattern).await?);
            }
            keys.sort();
            keys.dedup();
            removed += self.store.delete(&keys).await?;

            if event.is_publish() && event.spec.op != OpType::Delete {
                self.index.record(event).await?;
            }
        }
        if removed > 0 {
            tracing::debug!(events = events.len(), removed, "purged remote cache keys");
        }
        Ok(removed)
    }
}

/// Per-app sorted set of publishes scored by publish time.
pub struct PublishIndex {
    store: Arc<dyn DurableStore>,
}

impl PublishIndex {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    fn key(biz_id: BizId, app_id: AppId) -> String {
        format!("{{{}}}{}:publish-index:{}", biz_id, CACHE_KEY_HEAD, app_id)
    }

    /// Record a publish event. The event's resource id is the release id.
    pub async fn record(&self, event: &EventMeta) -> TrellisResult<()> {
        let key = Self::key(event.attachment.biz_id, event.attachment.app_id);
        let score = event.created_at.timestamp_millis() as f64;
        self.store
            .zadd(&key, score, &event.spec.resource_id.to_string())
            .await
    }

    /// Releases published in `[from, to]`, oldest first.
    pub async fn published_between(
        &self,
        biz_id: BizId,
        app_id: AppId,
        from: Timestamp,
        to: Timestamp,
    ) -> TrellisResult<Vec<ReleaseId>> {
        let members = self
            .store
            .zrange_by_score(
                &Self::key(biz_id, app_id),
                from.timestamp_millis() as f64,
                to.timestamp_millis() as f64,
            )
            .await?;
        Ok(members
            .iter()
            .filter_map(|m| m.parse::<ReleaseId>().ok())
            .collect())
    }
}
