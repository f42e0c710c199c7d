//! Token-bucket rate limiting for the crawler.
//!
//! Non-blocking callers always proceed and may drive the balance negative;
//! the next blocking caller then pays the debt. The crawler task acquires
//! blocking, helper tasks non-blocking, so only the crawler self-throttles.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last: Instant,
}

pub struct RateLimiter {
    name: &'static str,
    per_sec: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `per_sec` units per second, with up to one second of burst. A rate
    /// that is not a positive finite number does not throttle.
    pub fn new(name: &'static str, per_sec: f64) -> Self {
        let per_sec = if per_sec.is_finite() && per_sec > 0.0 {
            per_sec
        } else {
            f64::MAX
        };
        Self {
            name,
            per_sec,
            burst: per_sec.max(1.0),
            bucket: Mutex::new(Bucket {
                tokens: per_sec.max(1.0),
                last: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Consumes `cost` units. With `blocking`, sleeps until the balance is
    /// no longer negative and returns how long it waited.
    pub async fn acquire(&self, cost: f64, blocking: bool) -> Duration {
        let wait = {
            let mut bucket = self.bucket.lock().unwrap();
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * self.per_sec).min(self.burst);
            bucket.last = now;
            bucket.tokens -= cost;
            if bucket.tokens >= 0.0 || !blocking {
                Duration::ZERO
            } else {
                Duration::try_from_secs_f64(-bucket.tokens / self.per_sec)
                    .unwrap_or(Duration::ZERO)
            }
        };
        if !wait.is_zero() {
            tracing::trace!(limiter = self.name, wait_ms = wait.as_millis() as u64, "throttled");
            tokio::time::sleep(wait).await;
        }
        wait
    }
}

/// The three limits the crawler applies.
pub struct CrawlLimits {
    pub directories: RateLimiter,
    pub bytes: RateLimiter,
    pub files: RateLimiter,
}

impl CrawlLimits {
    pub fn from_config(config: &crate::config::CrawlerConfig) -> Self {
        Self {
            directories: RateLimiter::new("directories", config.directories_per_sec),
            bytes: RateLimiter::new("bytes", config.bytes_per_sec),
            files: RateLimiter::new("files", config.files_per_sec),
        }
    }
}
