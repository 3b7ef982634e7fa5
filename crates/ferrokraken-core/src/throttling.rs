use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 2;

/// Aggregate request gate shared by every resource in a run.
///
/// Clones share one limiter. An unlimited gate never waits.
#[derive(Clone, Default)]
pub struct RateGate {
    limiter: Option<Arc<DirectRateLimiter>>,
}

impl RateGate {
    pub fn new(quota_window: Duration, quota_limit: u32) -> Self {
        Self {
            limiter: Some(Arc::new(RateLimiter::direct(quota_from_window(
                quota_window,
                quota_limit,
            )))),
        }
    }

    /// `0` disables throttling.
    pub fn per_second(requests: u32) -> Self {
        if requests == 0 {
            return Self::unlimited();
        }
        Self::new(Duration::from_secs(1), requests)
    }

    pub fn unlimited() -> Self {
        Self { limiter: None }
    }

    pub const fn is_limited(&self) -> bool {
        self.limiter.is_some()
    }

    /// Waits until the next request fits the quota.
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    /// Takes budget without waiting; `false` when the quota is exhausted.
    pub fn try_acquire(&self) -> bool {
        self.limiter
            .as_ref()
            .is_none_or(|limiter| limiter.check().is_ok())
    }
}

impl std::fmt::Debug for RateGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGate")
            .field("limited", &self.is_limited())
            .finish()
    }
}

fn quota_from_window(quota_window: Duration, quota_limit: u32) -> Quota {
    let safe_limit = quota_limit.max(1);
    let burst = NonZeroU32::new(safe_limit).expect("safe limit must be non-zero");

    let seconds_per_cell = (quota_window.as_secs_f64() / f64::from(safe_limit)).max(0.001);
    Quota::with_period(Duration::from_secs_f64(seconds_per_cell))
        .expect("period is always greater than zero")
        .allow_burst(burst)
}
