use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::warn;

/// Fixed-window admission control, one counter per key.
///
/// Windows reset lazily on the next `allow` call past the boundary rather
/// than from a timer, so many keys never accumulate background timers.
/// Uses [`tokio::time::Instant`] so tests can drive it with a paused clock.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    buckets: DashMap<Box<str>, Window>,
}

struct Window {
    count: u32,
    reset_at: Instant,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            buckets: DashMap::new(),
        }
    }

    /// Admit or reject one call for `key`. Rejection is local; the caller
    /// surfaces it as a `RateLimited` error without touching the network.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entry = self
            .buckets
            .entry(key.into())
            .or_insert_with(|| Window {
                count: 0,
                reset_at: now + self.window,
            });

        if now >= entry.reset_at {
            entry.count = 0;
            entry.reset_at = now + self.window;
        }

        if entry.count >= self.limit {
            warn!(key, limit = self.limit, "rate limit exceeded");
            return false;
        }

        entry.count += 1;
        true
    }
}

impl Default for RateLimiter {
    /// 100 requests per 60 seconds, the service's documented limit.
    fn default() -> Self {
        Self::new(100, Duration::from_secs(60))
    }
}
