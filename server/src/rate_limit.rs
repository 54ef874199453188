use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    window_reset_at: i64,
}

/// Fixed-window limiter for room creation, keyed by origin address.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<String, Bucket>>,
    window: Duration,
    max_per_window: u32,
}

impl RateLimiter {
    pub fn new(window: Duration, max_per_window: u32) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            window,
            max_per_window,
        }
    }

    /// Count one attempt for `key`, failing once the window's budget is spent.
    pub fn check(&self, key: &str, now: i64) -> SyncResult<()> {
        let window_ms = self.window.as_millis() as i64;
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            window_reset_at: now + window_ms,
        });

        if now > bucket.window_reset_at {
            *bucket = Bucket {
                count: 0,
                window_reset_at: now + window_ms,
            };
        }

        if bucket.count >= self.max_per_window {
            tracing::warn!("Room creation rate limit hit for {}", key);
            return Err(SyncError::RateLimited);
        }

        bucket.count += 1;
        Ok(())
    }

    /// Forget buckets whose window has already closed.
    pub fn prune(&self, now: i64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.window_reset_at >= now);
        before - self.buckets.len()
    }
}
