//! Per-channel request pacing for channels that declare a per-minute quota.
//!
//! Token bucket per channel id: burst equals the per-minute limit, refilled
//! continuously. A dry bucket makes the selector skip the channel for this
//! attempt rather than queue behind it.

use dashmap::DashMap;
use std::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(burst: u32) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, burst: u32, refill_per_sec: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(burst as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
pub struct ChannelRateLimiter {
    buckets: DashMap<i64, Bucket>,
}

impl ChannelRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take one slot on the channel. `per_minute` is the channel's
    /// declared limit; `None` means unlimited.
    pub fn check(&self, channel_id: i64, per_minute: Option<u32>) -> bool {
        let Some(limit) = per_minute else {
            return true;
        };
        if limit == 0 {
            return true;
        }
        let mut bucket = self
            .buckets
            .entry(channel_id)
            .or_insert_with(|| Bucket::new(limit));
        bucket.try_consume(limit, limit as f64 / 60.0)
    }

    /// Evict buckets idle for more than five minutes.
    pub fn cleanup(&self) {
        let cutoff = Instant::now() - std::time::Duration::from_secs(300);
        self.buckets.retain(|_, b| b.last_refill > cutoff);
    }
}
