//! Token bucket rate limiting for user- and tool-level quotas.
//!
//! Buckets refill continuously at `rate` tokens per second up to `capacity`.
//! A call consumes one token; when the bucket is empty the call is denied
//! immediately with a retry-after hint rather than queued, keeping latency
//! bounded.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// What a bucket key is counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    User,
    Tool,
}

/// Rate limit parameters for one bucket class.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Sustained requests per minute.
    pub requests_per_minute: u32,
    /// Maximum burst (bucket capacity).
    pub burst_size: u32,
}

impl RateLimitConfig {
    pub fn tokens_per_second(&self) -> f64 {
        f64::from(self.requests_per_minute) / 60.0
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 1000,
            burst_size: 2000,
        }
    }
}

/// Outcome of a consume attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until one token is available; 0 when allowed.
    pub retry_after_secs: f64,
}

/// Single token bucket. Mutated only through `consume`.
#[derive(Debug)]
struct TokenBucket {
    config: RateLimitConfig,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            tokens: f64::from(config.burst_size),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.config.tokens_per_second())
            .min(f64::from(self.config.burst_size));
        self.last_refill = now;
    }

    fn consume(&mut self, now: Instant) -> RateLimitDecision {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            RateLimitDecision {
                allowed: true,
                limit: self.config.requests_per_minute,
                remaining: self.tokens as u32,
                retry_after_secs: 0.0,
            }
        } else {
            let needed = 1.0 - self.tokens;
            RateLimitDecision {
                allowed: false,
                limit: self.config.requests_per_minute,
                remaining: 0,
                retry_after_secs: needed / self.config.tokens_per_second(),
            }
        }
    }
}

/// Keyed token bucket registry shared across all sessions.
///
/// Explicitly constructed and owned by the application state; buckets are
/// created lazily per key and live for the process lifetime. Stale buckets
/// are dropped opportunistically during checks.
pub struct RateLimiterRegistry {
    buckets: Mutex<HashMap<(SubjectKind, String), TokenBucket>>,
    user_config: RateLimitConfig,
    tool_config: RateLimitConfig,
    last_cleanup: Mutex<Instant>,
    cleanup_interval: Duration,
    stale_after: Duration,
}

impl RateLimiterRegistry {
    pub fn new(user_config: RateLimitConfig, tool_config: RateLimitConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            user_config,
            tool_config,
            last_cleanup: Mutex::new(Instant::now()),
            cleanup_interval: Duration::from_secs(300),
            stale_after: Duration::from_secs(600),
        }
    }

    /// Try to consume one token for the given subject.
    ///
    /// The read-modify-write for a key is atomic under the registry lock;
    /// cross-key operations never coordinate.
    pub async fn try_consume(&self, kind: SubjectKind, subject: &str) -> RateLimitDecision {
        self.maybe_cleanup().await;

        let config = match kind {
            SubjectKind::User => self.user_config,
            SubjectKind::Tool => self.tool_config,
        };

        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry((kind, subject.to_string()))
            .or_insert_with(|| TokenBucket::new(config));
        let decision = bucket.consume(Instant::now());

        if !decision.allowed {
            tracing::debug!(
                subject = %subject,
                kind = ?kind,
                retry_after = decision.retry_after_secs,
                "Rate limit exceeded"
            );
        }

        decision
    }

    async fn maybe_cleanup(&self) {
        let now = Instant::now();
        {
            let mut last = self.last_cleanup.lock().await;
            if now.duration_since(*last) < self.cleanup_interval {
                return;
            }
            *last = now;
        }

        let mut buckets = self.buckets.lock().await;
        let stale_after = self.stale_after;
        buckets.retain(|_, bucket| now.duration_since(bucket.last_refill) < stale_after);
    }

    #[cfg(test)]
    async fn backdate(&self, kind: SubjectKind, subject: &str, by: Duration) {
        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get_mut(&(kind, subject.to_string())) {
            bucket.last_refill -= by;
        }
    }
}
