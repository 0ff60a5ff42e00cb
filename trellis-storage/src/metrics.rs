//! Prometheus metrics of the remote cache tier.

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry, IntCounter,
    IntCounterVec, Registry,
};
use trellis_core::{ResourceKind, TrellisError, TrellisResult};

pub(crate) fn register_failed(name: &str, e: prometheus::Error) -> TrellisError {
    TrellisError::InvalidParameter(format!("Failed to register {}: {}", name, e))
}

/// Counters of the remote cache tier, registered on an explicit registry.
#[derive(Clone)]
pub struct RemoteCacheMetrics {
    /// Cache reads - labels: kind, result (hit/miss/null)
    pub reads_total: IntCounterVec,

    /// Source-of-record refreshes - labels: kind, status (success/failure)
    pub refresh_total: IntCounterVec,

    /// NullValue sentinels written - labels: kind
    pub null_writes_total: IntCounterVec,

    /// Lock outcomes - labels: kind, state (acquired/with_limit/waited)
    pub lock_states_total: IntCounterVec,

    /// Inconsistent errors returned to callers
    pub inconsistent_total: IntCounter,
}

impl RemoteCacheMetrics {
    pub fn new(registry: &Registry) -> TrellisResult<Self> {
        Ok(Self {
            reads_total: register_int_counter_vec_with_registry!(
                "trellis_remote_cache_reads_total",
                "Remote cache reads by resource kind and result",
                &["kind", "result"],
                registry
            )
            .map_err(|e| register_failed("trellis_remote_cache_reads_total", e))?,

            refresh_total: register_int_counter_vec_with_registry!(
                "trellis_remote_cache_refresh_total",
                "Source-of-record refreshes by resource kind and status",
                &["kind", "status"],
                registry
            )
            .map_err(|e| register_failed("trellis_remote_cache_refresh_total", e))?,

            null_writes_total: register_int_counter_vec_with_registry!(
                "trellis_remote_cache_null_writes_total",
                "Negative cache entries written",
                &["kind"],
                registry
            )
            .map_err(|e| register_failed("trellis_remote_cache_null_writes_total", e))?,

            lock_states_total: register_int_counter_vec_with_registry!(
                "trellis_remote_cache_lock_states_total",
                "Resource lock acquisition outcomes",
                &["kind", "state"],
                registry
            )
            .map_err(|e| register_failed("trellis_remote_cache_lock_states_total", e))?,

            inconsistent_total: register_int_counter_with_registry!(
                "trellis_remote_cache_inconsistent_total",
                "Reads that failed because the cache lagged a publish",
                registry
            )
            .map_err(|e| register_failed("trellis_remote_cache_inconsistent_total", e))?,
        })
    }

    pub fn record_read(&self, kind: ResourceKind, result: &str) {
        self.reads_total
            .with_label_values(&[kind.namespace(), result])
            .inc();
    }

    pub fn record_refresh(&self, kind: ResourceKind, success: bool) {
        let status = if success { "success" } else { "failure" };
        self.refresh_total
            .with_label_values(&[kind.namespace(), status])
            .inc();
    }

    pub fn record_lock(&self, kind: ResourceKind, state: &str) {
        self.lock_states_total
            .with_label_values(&[kind.namespace(), state])
            .inc();
    }

    pub fn read_count(&self, kind: ResourceKind, result: &str) -> u64 {
        self.reads_total
            .with_label_values(&[kind.namespace(), result])
            .get()
    }
}
