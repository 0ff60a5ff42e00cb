//! Shared configuration primitives

use crate::{TrellisError, TrellisResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Inclusive `[min, max]` TTL range for one resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlRange {
    pub min: Duration,
    pub max: Duration,
}

impl TtlRange {
    pub fn new(min: Duration, max: Duration) -> TrellisResult<Self> {
        if min.is_zero() || min > max {
            return Err(TrellisError::InvalidParameter(format!(
                "invalid ttl range [{:?}, {:?}]",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub const fn from_secs(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_secs(min),
            max: Duration::from_secs(max),
        }
    }

    pub fn contains(&self, ttl: Duration) -> bool {
        ttl >= self.min && ttl <= self.max
    }

    /// Width of the range in whole seconds.
    pub fn spread_secs(&self) -> u64 {
        self.max.as_secs().saturating_sub(self.min.as_secs())
    }
}

/// Rate limiter parameters shared by lock admission, matcher and retry drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub qps: u32,
    pub burst: u32,
}

impl RateLimit {
    pub const fn new(qps: u32, burst: u32) -> Self {
        Self { qps, burst }
    }
}

// ============================================================================
// ENVIRONMENT HELPERS
// ============================================================================

/// Read and parse an env var, falling back to `default` when unset or unparsable.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

pub fn env_duration_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

pub fn env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

pub fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

/// Parse a `min,max` pair of seconds, e.g. `TRELLIS_TTL_APP_META=900,1800`.
pub fn env_ttl_range(key: &str, default: TtlRange) -> TtlRange {
    std::env::var(key)
        .ok()
        .and_then(|s| {
            let (min, max) = s.split_once(',')?;
            let min = min.trim().parse::<u64>().ok()?;
            let max = max.trim().parse::<u64>().ok()?;
            TtlRange::new(Duration::from_secs(min), Duration::from_secs(max)).ok()
        })
        .unwrap_or(default)
}
