//! Token bucket admission control shared by every upstream fetch.
//!
//! Tokens accrue continuously at `capacity / interval` up to `capacity`. Refill is recomputed
//! from the elapsed time on every access, so idle periods neither over nor under credit the
//! bucket. Waiting callers are released strictly in arrival order.

use crate::config::{env_millis_or, env_or};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use tokio::time::Instant;
use tracing::trace;

/// [`RateLimiter`] configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimiterConfig {
    /// Maximum number of tokens the bucket holds, and the number granted per `interval`.
    pub capacity: u32,
    /// Window over which `capacity` tokens are refilled.
    pub interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            interval: Duration::from_secs(1),
        }
    }
}

impl RateLimiterConfig {
    /// Create a new configuration granting `capacity` tokens every `interval`.
    pub fn new(capacity: u32, interval: Duration) -> Self {
        Self { capacity, interval }
    }

    /// Read `DS_TOKENS_PER_INTERVAL` and `DS_INTERVAL_MS`, falling back to the defaults.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            capacity: env_or("DS_TOKENS_PER_INTERVAL", default.capacity),
            interval: env_millis_or("DS_INTERVAL_MS", default.interval),
        }
    }

    /// Set bucket capacity
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set refill interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Point in time snapshot of a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimiterStats {
    pub capacity: u32,
    pub interval: Duration,
    /// Whole tokens currently available.
    pub available: u32,
    /// Callers currently waiting for a token.
    pub queued: usize,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter with FIFO fairness.
///
/// [`RateLimiter::acquire`] never fails, it only delays. Ordering is provided by a fair
/// [`tokio::sync::Mutex`]: the caller at the head of the line is the only one sleeping, and it
/// sleeps exactly as long as its token takes to accrue.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    tokens_per_sec: f64,
    bucket: Mutex<Bucket>,
    line: tokio::sync::Mutex<()>,
    waiting: AtomicUsize,
}

impl RateLimiter {
    /// Construct a full [`RateLimiter`] from the provided [`RateLimiterConfig`].
    pub fn new(config: RateLimiterConfig) -> Self {
        let config = RateLimiterConfig {
            capacity: config.capacity.max(1),
            interval: config.interval.max(Duration::from_millis(1)),
        };

        Self {
            tokens_per_sec: f64::from(config.capacity) / config.interval.as_secs_f64(),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(config.capacity),
                last_refill: Instant::now(),
            }),
            line: tokio::sync::Mutex::new(()),
            waiting: AtomicUsize::new(0),
            config,
        }
    }

    pub fn config(&self) -> RateLimiterConfig {
        self.config
    }

    /// Wait for, and consume, a single token.
    ///
    /// Resolves on first poll if a token is available and nobody is queued ahead. Dropping the
    /// returned future gives up the caller's place in line.
    pub async fn acquire(&self) {
        let _waiting = WaitingGuard::new(&self.waiting);
        let _turn = self.line.lock().await;

        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket, Instant::now());

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }

                self.time_until_token(bucket.tokens)
            };

            trace!(?wait, "RateLimiter waiting for token");
            tokio::time::sleep(wait).await;
        }
    }

    /// Consume a token without waiting. Returns `false` if none is available or callers are
    /// already queued.
    pub fn try_acquire(&self) -> bool {
        if self.waiting.load(Ordering::Acquire) > 0 {
            return false;
        }

        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        let available = {
            let mut bucket = self.bucket.lock();
            self.refill(&mut bucket, Instant::now());
            bucket.tokens.floor() as u32
        };

        RateLimiterStats {
            capacity: self.config.capacity,
            interval: self.config.interval,
            available,
            queued: self.waiting.load(Ordering::Acquire),
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if elapsed.is_zero() {
            return;
        }

        let capacity = f64::from(self.config.capacity);
        bucket.tokens = capacity.min(bucket.tokens + elapsed.as_secs_f64() * self.tokens_per_sec);
        bucket.last_refill = now;
    }

    fn time_until_token(&self, tokens: f64) -> Duration {
        let deficit = (1.0 - tokens).max(0.0);
        let nanos = (deficit / self.tokens_per_sec * 1e9).ceil();
        Duration::from_nanos(nanos as u64).max(Duration::from_nanos(1))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn new(waiting: &'a AtomicUsize) -> Self {
        waiting.fetch_add(1, Ordering::AcqRel);
        Self(waiting)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
