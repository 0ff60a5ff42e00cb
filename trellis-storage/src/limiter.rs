//! Token-bucket limiters shared by lock admission, the matcher and retry drains.

use governor::{clock::DefaultClock, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;
use trellis_core::{RateLimit, TrellisError, TrellisResult};

/// Type alias for the unkeyed limiter we use.
pub type DirectRateLimiter =
    RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, DefaultClock>;

pub fn direct_limiter(limit: RateLimit) -> DirectRateLimiter {
    let quota = Quota::per_second(NonZeroU32::new(limit.qps).unwrap_or(NonZeroU32::MIN))
        .allow_burst(NonZeroU32::new(limit.burst).unwrap_or(NonZeroU32::MIN));
    RateLimiter::direct(quota)
}

/// Wait for a permit for at most `budget`, failing fast past it.
pub async fn wait_permit(
    limiter: &DirectRateLimiter,
    budget: Duration,
    what: &str,
) -> TrellisResult<()> {
    if limiter.check().is_ok() {
        return Ok(());
    }
    tokio::time::timeout(budget, limiter.until_ready())
        .await
        .map_err(|_| {
            TrellisError::ResourceExhausted(format!("{} rate limit wait exceeded {:?}", what, budget))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_then_fail_fast() {
        let limiter = direct_limiter(RateLimit::new(1, 2));
        assert!(wait_permit(&limiter, Duration::from_millis(5), "test").await.is_ok());
        assert!(wait_permit(&limiter, Duration::from_millis(5), "test").await.is_ok());
        let err = wait_permit(&limiter, Duration::from_millis(5), "test")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
