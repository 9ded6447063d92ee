//! Per-peer rate limiting: a token bucket plus rolling minute/hour counters
//! and a temporary block list.
//!
//! Generalized from the teacher's IP-and-operation-keyed limiter
//! (`security::rate_limiting`) to per-peer keying, with rolling-window
//! counters added on top of the token bucket.

use crate::config::RateLimitConfig;
use dashmap::DashMap;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    Denied { retry_after_secs: u64 },
    Blocked { retry_after_secs: u64 },
}

struct TokenBucket {
    tokens: f64,
    burst_size: f64,
    tokens_per_second: f64,
    last_refill: f64,
    minute_window_start: f64,
    minute_count: u32,
    hour_window_start: f64,
    hour_count: u32,
    violations: u32,
    blocked_until: Option<f64>,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig, now: f64) -> Self {
        Self {
            tokens: config.burst_size as f64,
            burst_size: config.burst_size as f64,
            tokens_per_second: config.requests_per_minute as f64 / 60.0,
            last_refill: now,
            minute_window_start: now,
            minute_count: 0,
            hour_window_start: now,
            hour_count: 0,
            violations: 0,
            blocked_until: None,
        }
    }

    fn refill(&mut self, now: f64) {
        let elapsed = (now - self.last_refill).max(0.0);
        self.tokens = (self.tokens + elapsed * self.tokens_per_second).min(self.burst_size);
        self.last_refill = now;

        if now - self.minute_window_start >= 60.0 {
            self.minute_window_start = now;
            self.minute_count = 0;
        }
        if now - self.hour_window_start >= 3_600.0 {
            self.hour_window_start = now;
            self.hour_count = 0;
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn check(&self, peer_id: &str) -> RateLimitResult {
        let now = now_secs_f64();
        let mut bucket = self
            .buckets
            .entry(peer_id.to_string())
            .or_insert_with(|| TokenBucket::new(&self.config, now));
        bucket.refill(now);

        if let Some(until) = bucket.blocked_until {
            if now < until {
                return RateLimitResult::Blocked {
                    retry_after_secs: (until - now).ceil() as u64,
                };
            }
            bucket.blocked_until = None;
            bucket.violations = 0;
        }

        let over_minute = bucket.minute_count >= self.config.requests_per_minute;
        let over_hour = bucket.hour_count >= self.config.requests_per_hour;

        if bucket.tokens < 1.0 || over_minute || over_hour {
            bucket.violations += 1;
            let retry_after = if over_minute {
                (bucket.minute_window_start + 60.0 - now).max(1.0).ceil() as u64
            } else if over_hour {
                (bucket.hour_window_start + 3_600.0 - now).max(1.0).ceil() as u64
            } else {
                ((1.0 - bucket.tokens) / bucket.tokens_per_second.max(0.001)).ceil() as u64
            };
            if bucket.violations >= self.config.violations_before_block {
                bucket.blocked_until = Some(now + self.config.block_duration_secs as f64);
                return RateLimitResult::Blocked {
                    retry_after_secs: self.config.block_duration_secs,
                };
            }
            return RateLimitResult::Denied {
                retry_after_secs: retry_after,
            };
        }

        bucket.tokens -= 1.0;
        bucket.minute_count += 1;
        bucket.hour_count += 1;
        RateLimitResult::Allowed
    }

    /// Drops buckets untouched for longer than the configured idle cleanup
    /// interval.
    pub fn cleanup_idle(&self) {
        let now = now_secs_f64();
        let idle = self.config.idle_cleanup_secs as f64;
        self.buckets.retain(|_, b| now - b.last_refill < idle);
    }

    pub fn reset(&self, peer_id: &str) {
        self.buckets.remove(peer_id);
    }

    pub fn tracked_peers(&self) -> usize {
        self.buckets.len()
    }
}

fn now_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: 60,
            requests_per_hour: 1_000,
            burst_size: 3,
            violations_before_block: 2,
            block_duration_secs: 5,
            idle_cleanup_secs: 3_600,
        }
    }

    #[test]
    fn allows_up_to_burst_then_denies() {
        let limiter = RateLimiter::new(config());
        assert_eq!(limiter.check("peer-a"), RateLimitResult::Allowed);
        assert_eq!(limiter.check("peer-a"), RateLimitResult::Allowed);
        assert_eq!(limiter.check("peer-a"), RateLimitResult::Allowed);
        assert!(matches!(limiter.check("peer-a"), RateLimitResult::Denied { .. }));
    }

    #[test]
    fn peers_are_tracked_independently() {
        let limiter = RateLimiter::new(config());
        for _ in 0..3 {
            limiter.check("peer-a");
        }
        assert_eq!(limiter.check("peer-b"), RateLimitResult::Allowed);
    }

    #[test]
    fn repeated_violations_trigger_temporary_block() {
        let limiter = RateLimiter::new(config());
        for _ in 0..3 {
            limiter.check("peer-a");
        }
        limiter.check("peer-a"); // violation 1
        let result = limiter.check("peer-a"); // violation 2 -> block
        assert!(matches!(result, RateLimitResult::Blocked { .. }));
    }

    #[test]
    fn minute_cap_denies_once_exceeded_even_with_tokens_left() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 2,
            requests_per_hour: 1_000,
            burst_size: 100,
            violations_before_block: 99,
            block_duration_secs: 5,
            idle_cleanup_secs: 3_600,
        });
        assert_eq!(limiter.check("peer-a"), RateLimitResult::Allowed);
        assert_eq!(limiter.check("peer-a"), RateLimitResult::Allowed);
        assert!(matches!(limiter.check("peer-a"), RateLimitResult::Denied { .. }));
    }

    #[test]
    fn reset_clears_peer_state() {
        let limiter = RateLimiter::new(config());
        for _ in 0..3 {
            limiter.check("peer-a");
        }
        limiter.reset("peer-a");
        assert_eq!(limiter.check("peer-a"), RateLimitResult::Allowed);
    }
}
