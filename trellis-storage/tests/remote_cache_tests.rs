//! Behavioural tests of the remote cache tier against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use trellis_core::{
    AppMeta, ConfigType, PublishedStrategy, ReleaseId, ResourceKind, StrategyId, StrategyMode,
    StrategyScope, TrellisError,
};
use trellis_storage::{
    CacheKey, CacheService, DurableStore, InMemoryDurableStore, InMemorySource, RemoteCache,
    RemoteCacheConfig, RemoteCacheMetrics, ReleaseSnapshot,
};
use trellis_test_utils::CountingSource;

fn app() -> AppMeta {
    AppMeta {
        biz_id: 2,
        app_id: 7,
        name: "payment".into(),
        config_type: ConfigType::File,
        mode: StrategyMode::Normal,
        memo: String::new(),
    }
}

fn strategy(id: StrategyId, release_id: ReleaseId) -> PublishedStrategy {
    PublishedStrategy {
        strategy_id: id,
        app_id: 7,
        release_id,
        as_default: id == 1,
        mode: StrategyMode::Normal,
        namespace: String::new(),
        scope: StrategyScope::default(),
    }
}

struct Harness {
    cache: Arc<RemoteCache>,
    source: Arc<CountingSource>,
    store: Arc<InMemoryDurableStore>,
}

fn harness(config: RemoteCacheConfig, delay: Duration) -> Harness {
    let inner = InMemorySource::new();
    inner.upsert_app(app()).unwrap();
    inner
        .add_release(
            2,
            ReleaseSnapshot {
                release_id: 10,
                ..Default::default()
            },
        )
        .unwrap();
    let source = Arc::new(CountingSource::new(inner).with_delay(delay));
    let store = Arc::new(InMemoryDurableStore::new());
    let metrics = RemoteCacheMetrics::new(&Registry::new()).unwrap();
    let cache = Arc::new(RemoteCache::new(
        store.clone(),
        source.clone(),
        &config,
        metrics,
    ));
    Harness {
        cache,
        source,
        store,
    }
}

#[tokio::test]
async fn test_hit_after_refresh() {
    let h = harness(RemoteCacheConfig::default(), Duration::ZERO);
    let first = h.cache.get_app_meta(2, 7).await.unwrap();
    let second = h.cache.get_app_meta(2, 7).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.source.calls(), 1);

    let meta: AppMeta = serde_json::from_str(&first).unwrap();
    assert_eq!(meta, app());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_share_one_refresh() {
    let config = RemoteCacheConfig::default()
        .with_lock_admission(10_000, 10)
        .with_lock_wait(Duration::from_secs(2));
    let h = harness(config, Duration::from_millis(50));

    let n = 32;
    let mut handles = Vec::new();
    for _ in 0..n {
        let cache = h.cache.clone();
        handles.push(tokio::spawn(async move { cache.get_app_meta(2, 7).await }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(h.source.calls(), 1);
}

#[tokio::test]
async fn test_absent_record_is_negatively_cached() {
    let config = RemoteCacheConfig::default()
        .with_null_ttl(trellis_core::TtlRange::from_secs(5, 10));
    let h = harness(config, Duration::ZERO);

    let err = h.cache.get_app_meta(2, 99).await.unwrap_err();
    assert!(err.is_not_found());
    let err = h.cache.get_app_meta(2, 99).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(h.source.calls(), 1);

    let ttl = h.store.ttl_of(&CacheKey::app_meta(2, 99).render()).unwrap();
    assert!(ttl <= Duration::from_secs(10));
    assert!(ttl > Duration::from_secs(4));
}

#[tokio::test]
async fn test_values_use_kind_ttl_range() {
    let range = trellis_core::TtlRange::from_secs(100, 200);
    let config = RemoteCacheConfig::default().with_ttl(ResourceKind::ReleasedConfigItem, range);
    let h = harness(config, Duration::ZERO);
    h.cache.get_released_config_items(2, 10).await.unwrap();
    let ttl = h
        .store
        .ttl_of(&CacheKey::released_config_items(2, 10).render())
        .unwrap();
    assert!(ttl <= Duration::from_secs(200));
    assert!(ttl > Duration::from_secs(99));
}

#[tokio::test]
async fn test_strategies_written_atomically_in_pages() {
    let config = RemoteCacheConfig::default().with_strategy_page_size(2);
    let h = harness(config, Duration::ZERO);
    h.source
        .inner()
        .publish(2, 7, vec![strategy(1, 10), strategy(2, 20), strategy(3, 30)])
        .unwrap();

    let raw = h.cache.get_published_strategies(2, 7, &[3, 1, 2]).await.unwrap();
    let got: Vec<PublishedStrategy> = serde_json::from_str(&raw).unwrap();
    assert_eq!(
        got.iter().map(|s| s.strategy_id).collect::<Vec<_>>(),
        vec![3, 1, 2]
    );
    // two pages, one atomic write
    assert_eq!(h.source.calls(), 2);
    assert_eq!(h.store.write_count(), 1);

    h.cache.get_published_strategies(2, 7, &[1, 2, 3]).await.unwrap();
    assert_eq!(h.source.calls(), 2);
}

#[tokio::test]
async fn test_strategy_absent_after_publish_is_inconsistent() {
    let h = harness(RemoteCacheConfig::default(), Duration::ZERO);
    h.source.inner().publish(2, 7, vec![strategy(1, 10)]).unwrap();

    let err = h
        .cache
        .get_published_strategies(2, 7, &[1, 5])
        .await
        .unwrap_err();
    assert!(matches!(err, TrellisError::Inconsistent(_)));
    assert!(err.is_retryable());

    // The present strategy was cached, the absent one written as NullValue
    assert!(h
        .store
        .get(&CacheKey::strategy(2, 1).render())
        .await
        .unwrap()
        .is_some());
    assert!(h.store.ttl_of(&CacheKey::strategy(2, 5).render()).is_some());
}

#[tokio::test]
async fn test_saturated_pool_refreshes_without_exclusivity() {
    let config = RemoteCacheConfig::default().with_lock_pool_size(1);
    let h = harness(config, Duration::ZERO);
    let held = h
        .cache
        .locks()
        .acquire(ResourceKind::AppMeta, "unrelated")
        .await
        .unwrap();
    assert!(held.acquired());

    // The pool is full, so this miss refreshes directly instead of waiting
    assert!(h.cache.get_app_meta(2, 7).await.is_ok());
    assert_eq!(h.source.calls(), 1);
    assert_eq!(
        h.cache.metrics().lock_states_total.with_label_values(&["app-meta", "with_limit"]).get(),
        1
    );
    h.cache.locks().release(held, true);
}

#[tokio::test]
async fn test_async_download_task_roundtrip_through_store() {
    let h = harness(RemoteCacheConfig::default(), Duration::ZERO);
    let missing = h.cache.get_async_download_task(2, "t-1").await.unwrap_err();
    assert!(missing.is_not_found());

    let task = trellis_core::AsyncDownloadTask {
        biz_id: 2,
        app_id: 7,
        task_id: "t-1".into(),
        file_name: "bundle.tar".into(),
        file_signature: "abc".into(),
        targets: vec!["host-1".into()],
        status: trellis_core::DownloadTaskStatus::Running,
        updated_at: chrono::Utc::now(),
    };
    h.cache.set_async_download_task(&task).await.unwrap();
    let raw = h.cache.get_async_download_task(2, "t-1").await.unwrap();
    let back: trellis_core::AsyncDownloadTask = serde_json::from_str(&raw).unwrap();
    assert_eq!(back.status, trellis_core::DownloadTaskStatus::Running);
}
