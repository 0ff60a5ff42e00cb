//! Remote cache tier configuration.

use std::collections::HashMap;
use std::time::Duration;
use trellis_core::config::{env_duration_ms, env_or, env_ttl_range};
use trellis_core::constants::*;
use trellis_core::{RateLimit, ResourceKind, TtlRange};

#[derive(Debug, Clone)]
pub struct RemoteCacheConfig {
    /// Per-kind TTL ranges; kinds not listed use their built-in default.
    pub ttl: HashMap<ResourceKind, TtlRange>,
    /// TTL range of NullValue sentinels.
    pub null_ttl: TtlRange,
    /// Admission limiter in front of every lock acquisition.
    pub lock_admission: RateLimit,
    /// Max concurrent exclusive refresh slots per kind.
    pub lock_pool_size: usize,
    /// How long a non-holder waits for the holder before re-reading.
    pub lock_wait: Duration,
    /// Page size of paginated strategy refreshes.
    pub strategy_page_size: usize,
}

fn default_range(kind: ResourceKind) -> TtlRange {
    match kind {
        ResourceKind::AppMeta | ResourceKind::AppId => DEFAULT_APP_META_TTL,
        ResourceKind::ReleasedConfigItem
        | ResourceKind::ReleasedKv
        | ResourceKind::ReleasedHook => DEFAULT_RELEASED_TTL,
        ResourceKind::Strategy | ResourceKind::CpsIds | ResourceKind::ReleasedGroup => {
            DEFAULT_STRATEGY_TTL
        }
        ResourceKind::Credential => DEFAULT_CREDENTIAL_TTL,
        ResourceKind::InstanceRelease
        | ResourceKind::AsyncDownloadTask
        | ResourceKind::ClientMetric => DEFAULT_SHORT_TTL,
    }
}

impl Default for RemoteCacheConfig {
    fn default() -> Self {
        Self {
            ttl: HashMap::new(),
            null_ttl: DEFAULT_NULL_TTL,
            lock_admission: RateLimit::new(DEFAULT_LOCK_QPS, DEFAULT_LOCK_BURST),
            lock_pool_size: DEFAULT_LOCK_POOL_SIZE,
            lock_wait: DEFAULT_LOCK_WAIT,
            strategy_page_size: DEFAULT_STRATEGY_PAGE_SIZE,
        }
    }
}

impl RemoteCacheConfig {
    /// Load from `TRELLIS_REMOTE_*` environment variables.
    ///
    /// TTL ranges are read per kind as `TRELLIS_REMOTE_TTL_<KIND>=min,max`
    /// in seconds, e.g. `TRELLIS_REMOTE_TTL_APP_META=900,1800`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ttl = ResourceKind::ALL
            .iter()
            .map(|kind| {
                let var = format!(
                    "TRELLIS_REMOTE_TTL_{}",
                    kind.namespace().replace('-', "_").to_uppercase()
                );
                (*kind, env_ttl_range(&var, default_range(*kind)))
            })
            .collect();

        Self {
            ttl,
            null_ttl: env_ttl_range("TRELLIS_REMOTE_NULL_TTL", defaults.null_ttl),
            lock_admission: RateLimit::new(
                env_or("TRELLIS_REMOTE_LOCK_QPS", defaults.lock_admission.qps),
                env_or("TRELLIS_REMOTE_LOCK_BURST", defaults.lock_admission.burst),
            ),
            lock_pool_size: env_or("TRELLIS_REMOTE_LOCK_POOL_SIZE", defaults.lock_pool_size),
            lock_wait: env_duration_ms("TRELLIS_REMOTE_LOCK_WAIT_MS", defaults.lock_wait),
            strategy_page_size: env_or(
                "TRELLIS_REMOTE_STRATEGY_PAGE_SIZE",
                defaults.strategy_page_size,
            )
            .max(1),
        }
    }

    pub fn ttl_range(&self, kind: ResourceKind) -> TtlRange {
        self.ttl
            .get(&kind)
            .copied()
            .unwrap_or_else(|| default_range(kind))
    }

    pub fn with_ttl(mut self, kind: ResourceKind, range: TtlRange) -> Self {
        self.ttl.insert(kind, range);
        self
    }

    pub fn with_null_ttl(mut self, range: TtlRange) -> Self {
        self.null_ttl = range;
        self
    }

    pub fn with_lock_admission(mut self, qps: u32, burst: u32) -> Self {
        self.lock_admission = RateLimit::new(qps, burst);
        self
    }

    pub fn with_lock_pool_size(mut self, size: usize) -> Self {
        self.lock_pool_size = size;
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn with_strategy_page_size(mut self, size: usize) -> Self {
        self.strategy_page_size = size.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides() {
        let config = RemoteCacheConfig::default()
            .with_ttl(ResourceKind::Strategy, TtlRange::from_secs(1, 2))
            .with_lock_pool_size(3)
            .with_strategy_page_size(0);
        assert_eq!(config.ttl_range(ResourceKind::Strategy), TtlRange::from_secs(1, 2));
        assert_eq!(config.ttl_range(ResourceKind::AppMeta), DEFAULT_APP_META_TTL);
        assert_eq!(config.lock_pool_size, 3);
        assert_eq!(config.strategy_page_size, 1);
    }
}
