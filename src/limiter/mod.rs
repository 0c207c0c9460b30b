//! Per-key token bucket rate limiter
//!
//! Each client key owns a token bucket refilled continuously at
//! `rate / interval`. Keys in the exclusion set bypass the limiter without
//! creating state. A background task periodically evicts buckets that have
//! been idle longer than a threshold.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::LimiterConfig;

/// Tokens spent per allowed request.
const STEP: f64 = 1.0;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single token bucket. Starts full.
pub struct TokenBucket {
    state: RwLock<BucketState>,
    max_tokens: f64,
    refill_rate: f64,
    interval: Duration,
}

impl TokenBucket {
    fn new(max_tokens: f64, refill_rate: f64, interval: Duration) -> Self {
        Self {
            state: RwLock::new(BucketState {
                tokens: max_tokens,
                last_refill: Instant::now(),
            }),
            max_tokens,
            refill_rate,
            interval,
        }
    }

    /// Refill by the elapsed time and try to spend one token.
    pub fn allow(&self) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let now = Instant::now();
        let elapsed =
            now.duration_since(state.last_refill).as_secs_f64() / self.interval.as_secs_f64();
        state.last_refill = now;

        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.max_tokens);

        if state.tokens < STEP {
            return false;
        }

        state.tokens -= STEP;
        true
    }

    /// Time since the bucket was last touched.
    fn idle_for(&self) -> Duration {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_refill
            .elapsed()
    }
}

/// Rate limiter keyed by client IP (or any other string key).
pub struct IpRateLimiter {
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,
    rate: f64,
    burst: f64,
    interval: Duration,
    excluded: HashSet<String>,
}

impl IpRateLimiter {
    /// Create a limiter from its configuration section.
    pub fn new(config: &LimiterConfig) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            rate: config.rate,
            burst: config.burst,
            interval: config.interval,
            excluded: config.excluded.clone(),
        }
    }

    /// Check whether a request from `key` is allowed. Excluded keys are
    /// always allowed and never get a bucket.
    pub fn allow(&self, key: &str) -> bool {
        if self.excluded.contains(key) {
            return true;
        }

        self.bucket(key).allow()
    }

    /// Find or create the bucket for a key. Creation is double-checked
    /// under the exclusive lock so concurrent callers share one bucket.
    fn bucket(&self, key: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(bucket);
        }

        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            buckets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(TokenBucket::new(self.burst, self.rate, self.interval))),
        )
    }

    /// Drop every bucket idle longer than the threshold. Returns the number
    /// of evicted buckets. A concurrent `allow` may re-create a bucket that
    /// was just evicted; that bucket simply starts full again.
    pub fn evict_idle(&self, idle_threshold: Duration) -> usize {
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.idle_for() <= idle_threshold);
        before - buckets.len()
    }

    /// Current number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Spawn the idle-eviction task. It runs every `cleanup_period` until
    /// the token is cancelled and then signals completion through its join
    /// handle.
    pub fn spawn_cleanup(
        self: Arc<Self>,
        cleanup_period: Duration,
        idle_threshold: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = self;

        tokio::spawn(async move {
            info!(period = ?cleanup_period, idle = ?idle_threshold, "starting rate limit cleanup");

            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + cleanup_period, cleanup_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("stopping rate limit cleanup");
                        return;
                    }
                    _ = ticker.tick() => {
                        let count = limiter.evict_idle(idle_threshold);
                        debug!(count, "evicted idle rate limit buckets");
                    }
                }
            }
        })
    }
}
