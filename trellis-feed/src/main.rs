//! Trellis Feed Server Entry Point
//!
//! Wires the remote and local cache tiers, the change observer, the
//! notification scheduler and the watch endpoint, then serves until ctrl-c.

use std::sync::Arc;

use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use trellis_core::{TrellisError, TrellisResult};
use trellis_events::{ChangeObserver, ObserverMetrics, StoreEventLog};
use trellis_feed::lcache::run_hit_ratio_sampler;
use trellis_feed::{
    init_tracing, router, AppState, FeedConfig, FeedMetrics, FeedPurger, LocalCaches,
    PayloadBuilder, ReleaseMatcher, Scheduler, WatchHub,
};
use trellis_storage::{
    DurableStore, InMemoryDurableStore, InMemorySource, RemoteCache, RemoteCacheMetrics,
    RemotePurger, Snapshot,
};

#[tokio::main]
async fn main() -> TrellisResult<()> {
    let config = FeedConfig::from_env();
    init_tracing(&config.telemetry)?;

    let registry = Registry::new();
    let metrics = FeedMetrics::new(&registry)?;

    let source = match &config.snapshot_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "Loading source snapshot");
            InMemorySource::from_snapshot(Snapshot::load(path)?)
        }
        None => InMemorySource::new(),
    };
    let store = open_store(&config).await?;

    let remote = Arc::new(RemoteCache::new(
        Arc::clone(&store),
        Arc::new(source),
        &config.remote,
        RemoteCacheMetrics::new(&registry)?,
    ));
    let caches = Arc::new(LocalCaches::new(remote.clone(), &config.local, metrics.clone()));

    let purger = FeedPurger::new(caches.clone()).with_remote(RemotePurger::new(Arc::clone(&store)));
    // the change log lives beside the cache keys, so writers sharing the
    // store reach every feed process
    let observer = Arc::new(ChangeObserver::new(
        Arc::new(StoreEventLog::new(Arc::clone(&store))),
        Arc::new(purger),
        config.observer.clone(),
        ObserverMetrics::new(&registry)?,
    ));

    let matcher = Arc::new(ReleaseMatcher::new(
        caches.clone(),
        remote,
        &config.matcher,
        metrics.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        matcher,
        PayloadBuilder::new(caches.clone(), config.repository_root.clone()),
        observer.clone(),
        config.scheduler.clone(),
        metrics.clone(),
    ));
    let hub = Arc::new(WatchHub::new(scheduler.clone(), metrics));

    let shutdown = CancellationToken::new();
    let tasks = TaskTracker::new();
    let batches = observer.subscribe("scheduler")?;
    {
        let observer = observer.clone();
        let token = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = observer.run(token).await {
                tracing::error!(error = %e, "Change observer stopped");
            }
        });
    }
    tasks.spawn(scheduler.clone().run(batches, shutdown.clone()));
    tasks.spawn(scheduler.clone().run_retry_drain(shutdown.clone()));
    tasks.spawn(scheduler.run_reaper(shutdown.clone()));
    tasks.spawn(run_hit_ratio_sampler(
        caches.clone(),
        config.local.sample_interval,
        shutdown.clone(),
    ));
    tasks.close();

    let app = router(AppState {
        hub: hub.clone(),
        caches,
        observer,
        registry,
    });

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .map_err(|e| TrellisError::Unavailable(format!("Failed to bind {}: {}", config.bind, e)))?;
    tracing::info!(addr = %config.bind, "Starting trellis feed server");

    let budget = config.shutdown_budget;
    let signal_hub = hub.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            if let Err(e) = signal_hub.shutdown(budget).await {
                tracing::warn!(error = %e, "Watch handlers did not finish in time");
            }
        })
        .await
        .map_err(|e| TrellisError::Unavailable(format!("Server error: {}", e)))?;

    shutdown.cancel();
    tasks.wait().await;
    tracing::info!("Trellis feed server stopped");
    Ok(())
}

async fn open_store(config: &FeedConfig) -> TrellisResult<Arc<dyn DurableStore>> {
    match &config.store_url {
        #[cfg(feature = "redis")]
        Some(url) => Ok(Arc::new(trellis_storage::RedisDurableStore::connect(url).await?)),
        #[cfg(not(feature = "redis"))]
        Some(url) => {
            tracing::warn!(url = %url, "Built without redis support, using the in-memory store");
            Ok(Arc::new(InMemoryDurableStore::new()))
        }
        None => Ok(Arc::new(InMemoryDurableStore::new())),
    }
}
