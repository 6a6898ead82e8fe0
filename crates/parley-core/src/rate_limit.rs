//! Per-user sliding-window admission control.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied { retry_after_secs: u64 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Admitted request instants for one user inside the current window.
#[derive(Debug, Default)]
pub struct RateLimitBucket {
    hits: VecDeque<Instant>,
}

impl RateLimitBucket {
    /// Start of the live window: the oldest admitted request still counted.
    pub fn window_start(&self) -> Option<Instant> {
        self.hits.front().copied()
    }

    pub fn count(&self) -> usize {
        self.hits.len()
    }

    fn roll(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Sliding-window limiter keyed by user id.
///
/// Each `admit` call holds the user's map shard for the whole
/// check-and-increment, so concurrent calls for one user never both see
/// the last free slot.
pub struct RateLimiter {
    buckets: DashMap<String, RateLimitBucket>,
    window: Duration,
    max_requests: usize,
    enabled: bool,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            window,
            max_requests: max_requests.max(1),
            enabled: true,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        let mut limiter = Self::new(
            Duration::from_secs(config.window_secs),
            config.max_requests,
        );
        limiter.enabled = config.enabled;
        limiter
    }

    pub fn admit(&self, user_id: &str) -> Admission {
        self.admit_at(user_id, Instant::now())
    }

    pub fn admit_at(&self, user_id: &str, now: Instant) -> Admission {
        if !self.enabled {
            return Admission::Allowed;
        }

        let mut bucket = self.buckets.entry(user_id.to_string()).or_default();
        bucket.roll(now, self.window);

        if bucket.count() < self.max_requests {
            bucket.hits.push_back(now);
            return Admission::Allowed;
        }

        let oldest = bucket.window_start().unwrap_or(now);
        let reopens_in = self
            .window
            .saturating_sub(now.saturating_duration_since(oldest));
        let retry_after_secs = reopens_in.as_secs_f64().ceil().max(1.0) as u64;
        metrics::counter!(crate::metrics::RATE_LIMITED_TOTAL).increment(1);
        tracing::debug!(user_id, retry_after_secs, "rate limit exceeded");
        Admission::Denied { retry_after_secs }
    }

    /// Drop buckets with no hits in the current window.
    pub fn prune_idle(&self) -> usize {
        self.prune_idle_at(Instant::now())
    }

    pub fn prune_idle_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket.roll(now, self.window);
            bucket.count() > 0
        });
        before - self.buckets.len()
    }

    pub fn tracked_users(&self) -> usize {
        self.buckets.len()
    }
}
