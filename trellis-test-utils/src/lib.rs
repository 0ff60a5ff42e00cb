//! Trellis Test Utilities
//!
//! Shared test infrastructure for the trellis workspace:
//! - Instrumented doubles for the source of record, change log and purger
//! - Proptest generators for labels, selectors and strategy sets
//! - Fixtures for common apps, releases and instances
//! - Assertions over the error taxonomy

pub use trellis_core::{
    AppId, AppInstanceMeta, AppMeta, BizId, ConfigType, Credential, Element, EventAttachment,
    EventId, EventMeta, EventSpec, InstanceRelease, InstanceSpec, Labels, OpType, Operator,
    PublishedStrategy, ReleaseId, ReleasedConfigItem, ReleasedGroup, ReleasedHooks, ReleasedKv,
    ResourceType, Selector, StrategyId, StrategyMode, StrategyScope, SubStrategy, TrellisError,
    TrellisResult,
};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use trellis_events::{CachePurger, EventBatch, EventLog, InMemoryEventLog};
use trellis_storage::{InMemorySource, SourceOfRecord};

// ============================================================================
// INSTRUMENTED DOUBLES
// ============================================================================

/// Source of record that counts every call and can delay each one.
pub struct CountingSource {
    inner: InMemorySource,
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingSource {
    pub fn new(inner: InMemorySource) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn inner(&self) -> &InMemorySource {
        &self.inner
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn tick(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl SourceOfRecord for CountingSource {
    async fn app_meta(&self, biz_id: BizId, app_id: AppId) -> TrellisResult<Option<AppMeta>> {
        self.tick().await;
        self.inner.app_meta(biz_id, app_id).await
    }

    async fn app_id(&self, biz_id: BizId, app_name: &str) -> TrellisResult<Option<AppId>> {
        self.tick().await;
        self.inner.app_id(biz_id, app_name).await
    }

    async fn released_config_items(
        &self,
        biz_id: BizId,
        release_id: ReleaseId,
    ) -> TrellisResult<Option<Vec<ReleasedConfigItem>>> {
        self.tick().await;
        self.inner.released_config_items(biz_id, release_id).await
    }

    async fn released_kvs(
        &self,
        biz_id: BizId,
        release_id: ReleaseId,
    ) -> TrellisResult<Option<Vec<ReleasedKv>>> {
        self.tick().await;
        self.inner.released_kvs(biz_id, release_id).await
    }

    async fn released_hooks(
        &self,
        biz_id: BizId,
        release_id: ReleaseId,
    ) -> TrellisResult<Option<ReleasedHooks>> {
        self.tick().await;
        self.inner.released_hooks(biz_id, release_id).await
    }

    async fn released_groups(
        &self,
        biz_id: BizId,
        app_id: AppId,
    ) -> TrellisResult<Option<Vec<ReleasedGroup>>> {
        self.tick().await;
        self.inner.released_groups(biz_id, app_id).await
    }

    async fn credential(&self, biz_id: BizId, token: &str) -> TrellisResult<Option<Credential>> {
        self.tick().await;
        self.inner.credential(biz_id, token).await
    }

    async fn cps_ids(
        &self,
        biz_id: BizId,
        app_id: AppId,
        namespace: &str,
    ) -> TrellisResult<Option<Vec<StrategyId>>> {
        self.tick().await;
        self.inner.cps_ids(biz_id, app_id, namespace).await
    }

    async fn strategies(
        &self,
        biz_id: BizId,
        app_id: AppId,
        ids: &[StrategyId],
    ) -> TrellisResult<Vec<PublishedStrategy>> {
        self.tick().await;
        self.inner.strategies(biz_id, app_id, ids).await
    }

    async fn instance_release(
        &self,
        biz_id: BizId,
        app_id: AppId,
        uid: &str,
    ) -> TrellisResult<Option<InstanceRelease>> {
        self.tick().await;
        self.inner.instance_release(biz_id, app_id, uid).await
    }
}

/// Change log that fails a configured number of upcoming fetches.
#[derive(Default)]
pub struct FlakyEventLog {
    inner: InMemoryEventLog,
    failures: AtomicUsize,
    fetches: Mutex<Vec<EventId>>,
}

impl FlakyEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` fetches fail with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn append(&self, spec: EventSpec, attachment: EventAttachment) -> TrellisResult<EventMeta> {
        self.inner.append(spec, attachment)
    }

    /// Cursor passed to each fetch, in call order.
    pub fn fetch_cursors(&self) -> Vec<EventId> {
        self.fetches.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EventLog for FlakyEventLog {
    async fn list_events(&self, after: EventId, limit: usize) -> TrellisResult<Vec<EventMeta>> {
        if let Ok(mut fetches) = self.fetches.lock() {
            fetches.push(after);
        }
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TrellisError::Unavailable("change log offline".into()));
        }
        self.inner.list_events(after, limit).await
    }

    async fn cursor_reminder(&self) -> TrellisResult<EventId> {
        self.inner.cursor_reminder().await
    }
}

/// Purger that records the id of every event it is handed.
///
/// Given a subscriber's receiver through `watch`, it also notes whether a
/// batch reached that subscriber before the purge ran.
#[derive(Default)]
pub struct RecordingPurger {
    purged: Mutex<Vec<EventId>>,
    watched: Mutex<Option<mpsc::Receiver<EventBatch>>>,
    broadcast_first: AtomicBool,
}

impl RecordingPurger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn purged(&self) -> Vec<EventId> {
        self.purged.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn watch(&self, batches: mpsc::Receiver<EventBatch>) {
        if let Ok(mut watched) = self.watched.lock() {
            *watched = Some(batches);
        }
    }

    /// Hand back the watched receiver.
    pub fn take_watched(&self) -> Option<mpsc::Receiver<EventBatch>> {
        self.watched.lock().ok().and_then(|mut w| w.take())
    }

    pub fn broadcast_before_purge(&self) -> bool {
        self.broadcast_first.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CachePurger for RecordingPurger {
    async fn purge(&self, events: &[EventMeta]) -> TrellisResult<()> {
        if let Ok(mut watched) = self.watched.lock() {
            if let Some(batches) = watched.as_mut() {
                if batches.try_recv().is_ok() {
                    self.broadcast_first.store(true, Ordering::SeqCst);
                }
            }
        }
        self.purged
            .lock()
            .map_err(|_| TrellisError::poisoned("recording-purger"))?
            .extend(events.iter().map(|e| e.id));
        Ok(())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;

    const LABEL_KEYS: &[&str] = &["env", "zone", "tier", "region"];
    const LABEL_VALUES: &[&str] = &["prod", "test", "a", "b", "1", "2", "10"];

    pub fn arb_label_key() -> impl Strategy<Value = String> {
        prop::sample::select(LABEL_KEYS).prop_map(str::to_string)
    }

    pub fn arb_label_value() -> impl Strategy<Value = String> {
        prop::sample::select(LABEL_VALUES).prop_map(str::to_string)
    }

    pub fn arb_labels() -> impl Strategy<Value = Labels> {
        prop::collection::btree_map(arb_label_key(), arb_label_value(), 0..4)
    }

    pub fn arb_element() -> impl Strategy<Value = Element> {
        prop_oneof![
            (arb_label_key(), arb_label_value()).prop_map(|(k, v)| Element::equals(k, v)),
            (arb_label_key(), arb_label_value())
                .prop_map(|(k, v)| Element::new(k, Operator::Ne, v)),
            (arb_label_key(), 0i64..20).prop_map(|(k, n)| Element::new(k, Operator::Gt, n)),
            (arb_label_key(), prop::collection::vec(arb_label_value(), 1..3)).prop_map(
                |(k, vs)| Element::new(k, Operator::In, serde_json::Value::from(vs))
            ),
        ]
    }

    pub fn arb_selector() -> impl Strategy<Value = Selector> {
        prop_oneof![
            Just(Selector::match_all()),
            prop::collection::vec(arb_element(), 1..3).prop_map(Selector::all_of),
            prop::collection::vec(arb_element(), 1..3).prop_map(Selector::any_of),
        ]
    }

    pub fn arb_sub_strategy() -> impl Strategy<Value = Option<SubStrategy>> {
        prop::option::of(
            (100u32..200, arb_selector())
                .prop_map(|(release_id, selector)| SubStrategy { release_id, selector }),
        )
    }

    /// A normal-mode strategy set: one default plus up to four selector strategies.
    pub fn arb_normal_strategies(app_id: AppId) -> impl Strategy<Value = Vec<PublishedStrategy>> {
        (
            1u32..100,
            prop::collection::vec((1u32..100, arb_selector(), arb_sub_strategy()), 0..4),
        )
            .prop_map(move |(default_release, others)| {
                let mut strategies = vec![fixtures::default_strategy(app_id, 1, default_release)];
                for (i, (release_id, selector, sub)) in others.into_iter().enumerate() {
                    strategies.push(PublishedStrategy {
                        strategy_id: i as StrategyId + 2,
                        app_id,
                        release_id,
                        as_default: false,
                        mode: StrategyMode::Normal,
                        namespace: String::new(),
                        scope: StrategyScope {
                            selector: Some(selector),
                            sub_strategy: sub,
                        },
                    });
                }
                strategies
            })
    }

    pub fn arb_instance(app_id: AppId) -> impl Strategy<Value = AppInstanceMeta> {
        ("[a-z]{1,8}", arb_labels()).prop_map(move |(uid, labels)| AppInstanceMeta {
            biz_id: fixtures::BIZ,
            app_id,
            app: "payment".into(),
            namespace: String::new(),
            uid,
            labels,
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;
    use trellis_storage::ReleaseSnapshot;

    pub const BIZ: BizId = 2;
    pub const APP: AppId = 7;

    pub fn app_meta(app_id: AppId, name: &str, config_type: ConfigType, mode: StrategyMode) -> AppMeta {
        AppMeta {
            biz_id: BIZ,
            app_id,
            name: name.to_string(),
            config_type,
            mode,
            memo: String::new(),
        }
    }

    pub fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub fn default_strategy(app_id: AppId, id: StrategyId, release_id: ReleaseId) -> PublishedStrategy {
        PublishedStrategy {
            strategy_id: id,
            app_id,
            release_id,
            as_default: true,
            mode: StrategyMode::Normal,
            namespace: String::new(),
            scope: StrategyScope::default(),
        }
    }

    /// A normal-mode strategy selecting instances whose `key` equals `value`.
    pub fn label_strategy(
        app_id: AppId,
        id: StrategyId,
        release_id: ReleaseId,
        key: &str,
        value: &str,
    ) -> PublishedStrategy {
        PublishedStrategy {
            strategy_id: id,
            app_id,
            release_id,
            as_default: false,
            mode: StrategyMode::Normal,
            namespace: String::new(),
            scope: StrategyScope {
                selector: Some(Selector::all_of(vec![Element::equals(key, value)])),
                sub_strategy: None,
            },
        }
    }

    pub fn namespace_strategy(
        app_id: AppId,
        id: StrategyId,
        release_id: ReleaseId,
        namespace: &str,
    ) -> PublishedStrategy {
        PublishedStrategy {
            strategy_id: id,
            app_id,
            release_id,
            as_default: false,
            mode: StrategyMode::Namespace,
            namespace: namespace.to_string(),
            scope: StrategyScope::default(),
        }
    }

    pub fn instance_spec(uid: &str, labels: Labels) -> InstanceSpec {
        InstanceSpec {
            biz_id: BIZ,
            app_id: APP,
            app: "payment".into(),
            uid: uid.to_string(),
            namespace: String::new(),
            labels,
            config_type: ConfigType::File,
            match_patterns: Vec::new(),
        }
    }

    pub fn config_item(release_id: ReleaseId, id: u32, path: &str, name: &str) -> ReleasedConfigItem {
        ReleasedConfigItem {
            release_id,
            config_item_id: id,
            name: name.to_string(),
            path: path.to_string(),
            permission: Default::default(),
            signature: format!("sig-{}-{}", release_id, id),
            byte_size: 128,
        }
    }

    pub fn kv(release_id: ReleaseId, key: &str, value: &str) -> ReleasedKv {
        ReleasedKv {
            release_id,
            key: key.to_string(),
            kv_type: "string".into(),
            value: value.to_string(),
            signature: format!("sig-{}-{}", release_id, key),
        }
    }

    pub fn credential(token: &str, scopes: &[&str]) -> Credential {
        Credential {
            id: 1,
            biz_id: BIZ,
            name: format!("cred-{}", token),
            token: token.to_string(),
            enabled: true,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn publish_event(id: EventId, app_id: AppId, release_id: ReleaseId) -> EventMeta {
        EventMeta {
            id,
            spec: EventSpec {
                resource: ResourceType::Publish,
                resource_id: release_id,
                op: OpType::Insert,
            },
            attachment: EventAttachment { biz_id: BIZ, app_id },
            created_at: chrono::Utc::now(),
        }
    }

    pub fn app_delete_event(id: EventId, app_id: AppId) -> EventMeta {
        EventMeta {
            id,
            spec: EventSpec {
                resource: ResourceType::Application,
                resource_id: app_id,
                op: OpType::Delete,
            },
            attachment: EventAttachment { biz_id: BIZ, app_id },
            created_at: chrono::Utc::now(),
        }
    }

    /// A source holding app `APP` ("payment", file type) with releases 10 and
    /// 20 and a default strategy on release 10.
    pub fn seeded_source() -> InMemorySource {
        let source = InMemorySource::new();
        let seed = || -> TrellisResult<()> {
            source.upsert_app(app_meta(APP, "payment", ConfigType::File, StrategyMode::Normal))?;
            for release_id in [10, 20] {
                source.add_release(
                    BIZ,
                    ReleaseSnapshot {
                        release_id,
                        name: format!("v{}", release_id),
                        config_items: vec![
                            config_item(release_id, 1, "/etc/payment", "db.yaml"),
                            config_item(release_id, 2, "/etc/payment/certs", "ca.pem"),
                        ],
                        kvs: Vec::new(),
                        hooks: ReleasedHooks {
                            release_id,
                            ..Default::default()
                        },
                    },
                )?;
            }
            source.publish(BIZ, APP, vec![default_strategy(APP, 1, 10)])
        };
        if let Err(e) = seed() {
            panic!("seeding fixture source failed: {}", e);
        }
        source
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    use super::*;

    pub fn assert_not_found<T: std::fmt::Debug>(result: &TrellisResult<T>) {
        match result {
            Err(e) if e.is_not_found() => {}
            other => panic!("expected RecordNotFound, got {:?}", other),
        }
    }

    pub fn assert_retryable<T: std::fmt::Debug>(result: &TrellisResult<T>) {
        match result {
            Err(e) if e.is_retryable() => {}
            other => panic!("expected a retryable error, got {:?}", other),
        }
    }

    pub fn assert_aborted<T: std::fmt::Debug>(result: &TrellisResult<T>) {
        match result {
            Err(TrellisError::Aborted(_)) => {}
            other => panic!("expected Aborted, got {:?}", other),
        }
    }
}
