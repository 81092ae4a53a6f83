//! C3 — Rate Limiter. Token bucket per `(actor_id, bucket_key)`: a
//! `DashMap` of lazily-created `governor` buckets keyed by a string,
//! generalized from "per IP" to "per (actor, bucket_key)".

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use governor::{clock::DefaultClock, state::{InMemoryState, NotKeyed}, Quota, RateLimiter as GovernorLimiter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    Exceeded { retry_after: Duration },
}

type Bucket = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    pub capacity: u32,
    pub refill_per_sec: u32,
}

/// Thread-safe; buckets are created once per key and never removed for the
/// process lifetime.
pub struct RateLimiter {
    settings: RateLimitSettings,
    buckets: DashMap<String, Arc<Bucket>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self { settings, buckets: DashMap::new() }
    }

    fn bucket_for(&self, key: &str) -> Arc<Bucket> {
        if let Some(existing) = self.buckets.get(key) {
            return existing.clone();
        }
        let capacity = NonZeroU32::new(self.settings.capacity.max(1)).unwrap();
        let quota = if self.settings.refill_per_sec == 0 {
            Quota::per_second(capacity).allow_burst(capacity)
        } else {
            Quota::per_second(NonZeroU32::new(self.settings.refill_per_sec).unwrap()).allow_burst(capacity)
        };
        let bucket = Arc::new(GovernorLimiter::direct(quota));
        self.buckets.entry(key.to_string()).or_insert(bucket).clone()
    }

    /// `key` is the combined `(actor_id, bucket_key)` — callers format it,
    /// e.g. `"{actor_id}:{bucket_key}"`, so the limiter itself stays
    /// agnostic to what a "bucket key" means to the caller.
    pub fn allow(&self, key: &str, cost: u32) -> (bool, Option<Duration>) {
        let bucket = self.bucket_for(key);
        let cost = NonZeroU32::new(cost.max(1)).unwrap();
        match bucket.check_n(cost) {
            Ok(Ok(())) => (true, None),
            Ok(Err(not_until)) => {
                let wait = not_until.wait_time_from(governor::clock::Clock::now(&DefaultClock::default()));
                (false, Some(wait))
            }
            Err(_insufficient_capacity) => (false, Some(Duration::from_secs(1))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_within_capacity() {
        let limiter = RateLimiter::new(RateLimitSettings { capacity: 2, refill_per_sec: 1 });
        let (ok1, _) = limiter.allow("alice:chat", 1);
        let (ok2, _) = limiter.allow("alice:chat", 1);
        assert!(ok1);
        assert!(ok2);
    }

    #[test]
    fn denies_over_capacity() {
        let limiter = RateLimiter::new(RateLimitSettings { capacity: 1, refill_per_sec: 1 });
        let (ok1, _) = limiter.allow("bob:chat", 1);
        let (ok2, retry_after) = limiter.allow("bob:chat", 1);
        assert!(ok1);
        assert!(!ok2);
        assert!(retry_after.is_some());
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(RateLimitSettings { capacity: 1, refill_per_sec: 1 });
        let (ok1, _) = limiter.allow("alice:chat", 1);
        let (ok2, _) = limiter.allow("bob:chat", 1);
        assert!(ok1);
        assert!(ok2);
    }
}
