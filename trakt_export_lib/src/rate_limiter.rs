//! Token-bucket rate limiting, one bucket per service key. A collaborator
//! the orchestrator and OAuth coordinator consult before each outbound
//! request; never invoked from within a held lock belonging to another
//! component.

use std::{collections::HashMap, time::Duration};
use tokio::{sync::Mutex, time::Instant};

struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: u32, per_minute: u32) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_second: per_minute as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }

    /// Seconds to wait before one token is available, or `None` if one
    /// already is.
    fn take_or_wait(&mut self) -> Option<Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(deficit / self.refill_per_second))
        }
    }
}

/// Per-service-key token bucket. Dropping the future returned by `acquire`
/// (e.g. via a surrounding `tokio::select!` or `timeout`) cancels the wait
/// cleanly; no token is consumed unless `acquire` returns.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        let mut buckets = HashMap::new();
        buckets.insert("trakt_api".to_string(), Bucket::new(40, 40));
        buckets.insert("auth".to_string(), Bucket::new(10, 10));
        Self {
            buckets: Mutex::new(buckets),
        }
    }

    pub fn with_bucket(mut self, key: impl Into<String>, capacity: u32, per_minute: u32) -> Self {
        self.buckets
            .get_mut()
            .insert(key.into(), Bucket::new(capacity, per_minute));
        self
    }

    /// Blocks until a token for `key` is available. Unknown keys are
    /// unthrottled, which keeps ad-hoc callers (e.g. tests) from needing to
    /// register a bucket up front.
    pub async fn acquire(&self, key: &str) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                match buckets.get_mut(key) {
                    Some(bucket) => bucket.take_or_wait(),
                    None => None,
                }
            };
            match wait {
                None => return,
                Some(duration) => tokio::time::sleep(duration).await,
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_key_never_blocks() {
        let limiter = RateLimiter::new();
        for _ in 0..100 {
            limiter.acquire("unregistered").await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_waits_for_refill() {
        let limiter = RateLimiter::new().with_bucket("tiny", 1, 60);
        limiter.acquire("tiny").await;

        let start = Instant::now();
        limiter.acquire("tiny").await;
        assert!(Instant::now().duration_since(start) >= Duration::from_secs(1));
    }
}
