//! TTL selection for remote cache writes.
//!
//! Writes pick the max bound of a kind's range or a random point within it,
//! so that entries populated together do not expire together.

use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use trellis_core::{ResourceKind, TtlRange};

use super::config::RemoteCacheConfig;

#[derive(Debug, Clone)]
pub struct TtlPolicy {
    ranges: HashMap<ResourceKind, TtlRange>,
    null: TtlRange,
}

impl TtlPolicy {
    pub fn new(config: &RemoteCacheConfig) -> Self {
        let ranges = ResourceKind::ALL
            .iter()
            .map(|kind| (*kind, config.ttl_range(*kind)))
            .collect();
        Self {
            ranges,
            null: config.null_ttl,
        }
    }

    pub fn range(&self, kind: ResourceKind) -> TtlRange {
        self.ranges
            .get(&kind)
            .copied()
            .unwrap_or(trellis_core::constants::DEFAULT_SHORT_TTL)
    }

    /// TTL for a value of `kind`.
    pub fn ttl(&self, kind: ResourceKind) -> Duration {
        pick(self.range(kind))
    }

    /// Short, randomized TTL for a NullValue sentinel.
    pub fn null_ttl(&self) -> Duration {
        pick(self.null)
    }
}

fn pick(range: TtlRange) -> Duration {
    if range.max <= range.min {
        return range.max;
    }
    let min = range.min.as_millis() as u64;
    let max = range.max.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(min..=max))
}
