use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::LocalCaches;

/// Export every local cache's hit ratio until `shutdown` fires.
pub async fn run_hit_ratio_sampler(
    caches: Arc<LocalCaches>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(interval_ms = period.as_millis() as u64, "Hit ratio sampler started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Hit ratio sampler shutting down");
                break;
            }
            _ = ticker.tick() => {
                caches.export_hit_ratios();
            }
        }
    }
}
