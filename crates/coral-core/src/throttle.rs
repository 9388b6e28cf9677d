//! Replay pacing for queue sync passes.
//!
//! Reconnecting with a long backlog must not hammer the backend: the sync
//! pass asks this throttle for budget before each replayed mutation and
//! waits out the suggested delay when the quota is spent.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Quota-based pacing gate for offline-queue replay.
#[derive(Clone)]
pub struct ReplayThrottle {
    limiter: Arc<DirectRateLimiter>,
    retry_delay: Duration,
}

impl ReplayThrottle {
    pub fn new(quota_window: Duration, quota_limit: u32, retry_delay: Duration) -> Self {
        let quota = quota_from_window(quota_window, quota_limit);
        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            retry_delay,
        }
    }

    /// 120 replayed mutations per minute, re-checking every 500ms when spent.
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(60), 120, Duration::from_millis(500))
    }

    /// Tries to acquire replay budget. When budget is unavailable the
    /// recommended wait before re-checking is returned.
    pub fn acquire(&self) -> Result<(), Duration> {
        if self.limiter.check().is_ok() {
            Ok(())
        } else {
            Err(self.retry_delay)
        }
    }
}

fn quota_from_window(quota_window: Duration, quota_limit: u32) -> Quota {
    let safe_limit = quota_limit.max(1);
    let burst = NonZeroU32::new(safe_limit).expect("safe limit must be non-zero");

    let seconds_per_cell = (quota_window.as_secs_f64() / f64::from(safe_limit)).max(0.001);
    let period = Duration::from_secs_f64(seconds_per_cell);

    Quota::with_period(period)
        .expect("period is always greater than zero")
        .allow_burst(burst)
}
