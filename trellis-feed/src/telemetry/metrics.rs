//! Prometheus Metrics Definitions
//!
//! Local cache, scheduler and matcher metrics of the feed process. The
//! remote tier and the observer register their own families on the same
//! registry.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use prometheus::{
    register_gauge_vec_with_registry, register_histogram_with_registry,
    register_int_counter_vec_with_registry, register_int_gauge_with_registry, Encoder, GaugeVec,
    Histogram, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use trellis_core::{TrellisError, TrellisResult};

/// Release match latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s
const MATCH_LATENCY_BUCKETS: &[f64] =
    &[0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5];

fn register_failed(name: &str, e: prometheus::Error) -> TrellisError {
    TrellisError::InvalidParameter(format!("Failed to register {}: {}", name, e))
}

/// Container for all feed metrics.
#[derive(Clone)]
pub struct FeedMetrics {
    /// Local cache hits - labels: resource
    pub lcache_hits_total: IntCounterVec,

    /// Local cache misses - labels: resource
    pub lcache_misses_total: IntCounterVec,

    /// Remote tier or decode failures behind a local miss - labels: resource
    pub lcache_errors_total: IntCounterVec,

    /// Capacity evictions - labels: resource
    pub lcache_evictions_total: IntCounterVec,

    /// Sampled hit ratio - labels: resource
    pub lcache_hit_ratio: GaugeVec,

    /// Scheduler actors alive
    pub active_actors: IntGauge,

    /// Members subscribed across all actors
    pub consumers: IntGauge,

    /// Members waiting in the retry queue
    pub retry_queue_depth: IntGauge,

    /// Open watch connections
    pub watch_connections: IntGauge,

    /// Member notifications - labels: outcome
    pub notify_total: IntCounterVec,

    pub matcher_duration_seconds: Histogram,

    /// Release match failures - labels: code
    pub matcher_failures_total: IntCounterVec,
}

impl FeedMetrics {
    /// Create and register all metrics on `registry`.
    pub fn new(registry: &Registry) -> TrellisResult<Self> {
        Ok(Self {
            lcache_hits_total: register_int_counter_vec_with_registry!(
                "trellis_lcache_hits_total",
                "Local cache hits by resource",
                &["resource"],
                registry
            )
            .map_err(|e| register_failed("trellis_lcache_hits_total", e))?,

            lcache_misses_total: register_int_counter_vec_with_registry!(
                "trellis_lcache_misses_total",
                "Local cache misses by resource",
                &["resource"],
                registry
            )
            .map_err(|e| register_failed("trellis_lcache_misses_total", e))?,

            lcache_errors_total: register_int_counter_vec_with_registry!(
                "trellis_lcache_errors_total",
                "Local cache fill failures by resource",
                &["resource"],
                registry
            )
            .map_err(|e| register_failed("trellis_lcache_errors_total", e))?,

            lcache_evictions_total: register_int_counter_vec_with_registry!(
                "trellis_lcache_evictions_total",
                "Local cache capacity evictions by resource",
                &["resource"],
                registry
            )
            .map_err(|e| register_failed("trellis_lcache_evictions_total", e))?,

            lcache_hit_ratio: register_gauge_vec_with_registry!(
                "trellis_lcache_hit_ratio",
                "Sampled local cache hit ratio by resource",
                &["resource"],
                registry
            )
            .map_err(|e| register_failed("trellis_lcache_hit_ratio", e))?,

            active_actors: register_int_gauge_with_registry!(
                "trellis_scheduler_active_actors",
                "Per-app scheduler actors alive",
                registry
            )
            .map_err(|e| register_failed("trellis_scheduler_active_actors", e))?,

            consumers: register_int_gauge_with_registry!(
                "trellis_scheduler_consumers",
                "Members subscribed to release notifications",
                registry
            )
            .map_err(|e| register_failed("trellis_scheduler_consumers", e))?,

            retry_queue_depth: register_int_gauge_with_registry!(
                "trellis_scheduler_retry_queue_depth",
                "Members waiting for a notification retry",
                registry
            )
            .map_err(|e| register_failed("trellis_scheduler_retry_queue_depth", e))?,

            watch_connections: register_int_gauge_with_registry!(
                "trellis_watch_connections",
                "Open watch connections",
                registry
            )
            .map_err(|e| register_failed("trellis_watch_connections", e))?,

            notify_total: register_int_counter_vec_with_registry!(
                "trellis_scheduler_notify_total",
                "Member notifications by outcome",
                &["outcome"],
                registry
            )
            .map_err(|e| register_failed("trellis_scheduler_notify_total", e))?,

            matcher_duration_seconds: register_histogram_with_registry!(
                "trellis_matcher_duration_seconds",
                "Release match duration in seconds",
                MATCH_LATENCY_BUCKETS.to_vec(),
                registry
            )
            .map_err(|e| register_failed("trellis_matcher_duration_seconds", e))?,

            matcher_failures_total: register_int_counter_vec_with_registry!(
                "trellis_matcher_failures_total",
                "Release match failures by error code",
                &["code"],
                registry
            )
            .map_err(|e| register_failed("trellis_matcher_failures_total", e))?,
        })
    }

    pub fn record_notify(&self, outcome: &str) {
        self.notify_total.with_label_values(&[outcome]).inc();
    }
}

/// Render `registry` in the Prometheus text format.
pub fn render_metrics(registry: &Registry) -> Response {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
                .into_response()
        }
    }
}
