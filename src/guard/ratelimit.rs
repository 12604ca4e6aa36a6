//! Token buckets keyed by `(caller, operation class)`.
//!
//! A bucket starts full at `capacity` and refills continuously at
//! `refill_per_sec`. Each admitted call takes one token; a call that finds
//! less than one token is rejected before any work is done.
//!
//! A bucket that has refilled completely carries no state, so such buckets
//! are swept every [`SWEEP_INTERVAL`] and whenever the map reaches
//! [`MAX_BUCKETS`]. If every bucket is still draining at the cap, the one
//! idle longest is evicted so the map never grows past it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::OpClass;
use crate::config::RateLimitConfig;
use crate::error::{ApiError, ApiResult};

/// Hard cap on tracked `(caller, class)` pairs.
pub const MAX_BUCKETS: usize = 10_000;

/// Full buckets are swept at least this often.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

type BucketMap = HashMap<(String, OpClass), Bucket>;

struct Buckets {
    map: BucketMap,
    last_sweep: Instant,
}

/// Per-caller, per-class token buckets.
pub struct RateLimiter {
    limits: HashMap<OpClass, RateLimitConfig>,
    buckets: Mutex<Buckets>,
}

/// Built-in capacity and refill for a class; cheaper classes get more.
pub fn default_limit(class: OpClass) -> RateLimitConfig {
    let (capacity, refill_per_sec) = match class {
        OpClass::Roots => (60, 1.0),
        OpClass::Search => (30, 1.0),
        OpClass::Preview => (20, 0.5),
        OpClass::Rewrite => (10, 0.2),
        OpClass::Summarize => (5, 0.1),
        OpClass::Index => (2, 0.02),
    };
    RateLimitConfig {
        capacity,
        refill_per_sec,
    }
}

impl RateLimiter {
    /// Defaults per class, overridden by any configured `rate_limits` entry.
    /// Unknown class names were already rejected by config validation.
    pub fn new(overrides: &HashMap<String, RateLimitConfig>) -> Self {
        let limits = OpClass::ALL
            .iter()
            .map(|&class| {
                let limit = overrides
                    .get(class.as_str())
                    .copied()
                    .unwrap_or_else(|| default_limit(class));
                (class, limit)
            })
            .collect();
        Self {
            limits,
            buckets: Mutex::new(Buckets {
                map: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Take one token or fail with `RateLimited`.
    pub fn check(&self, caller: &str, class: OpClass) -> ApiResult<()> {
        self.check_at(caller, class, Instant::now())
    }

    pub(crate) fn check_at(&self, caller: &str, class: OpClass, now: Instant) -> ApiResult<()> {
        let limit = self
            .limits
            .get(&class)
            .copied()
            .unwrap_or_else(|| default_limit(class));
        let capacity = limit.capacity as f64;

        let mut guard = self.buckets.lock();
        let state = &mut *guard;
        let key = (caller.to_string(), class);
        let due = now.saturating_duration_since(state.last_sweep) >= SWEEP_INTERVAL;
        if due || state.map.len() >= MAX_BUCKETS {
            prune_full(&mut state.map, &self.limits, now);
            state.last_sweep = now;
        }
        if state.map.len() >= MAX_BUCKETS && !state.map.contains_key(&key) {
            evict_idlest(&mut state.map);
        }

        let bucket = state
            .map
            .entry(key)
            .or_insert(Bucket {
                tokens: capacity,
                last: now,
            });

        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * limit.refill_per_sec).min(capacity);
        bucket.last = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let wait = if limit.refill_per_sec > 0.0 {
                format!("retry in {:.1}s", (1.0 - bucket.tokens) / limit.refill_per_sec)
            } else {
                "no refill configured".to_string()
            };
            tracing::info!(caller, class = class.as_str(), "rate limited");
            Err(ApiError::RateLimited(format!(
                "{} budget exhausted for caller '{}' ({})",
                class.as_str(),
                caller,
                wait
            )))
        }
    }
}

/// Drop buckets that have refilled completely.
fn prune_full(
    buckets: &mut BucketMap,
    limits: &HashMap<OpClass, RateLimitConfig>,
    now: Instant,
) {
    buckets.retain(|(_, class), bucket| {
        let Some(limit) = limits.get(class) else {
            return false;
        };
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens + elapsed * limit.refill_per_sec < limit.capacity as f64
    });
}

fn evict_idlest(buckets: &mut BucketMap) {
    let idlest = buckets
        .iter()
        .min_by_key(|(_, bucket)| bucket.last)
        .map(|(key, _)| key.clone());
    if let Some(key) = idlest {
        buckets.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(class: &str, capacity: u32, refill_per_sec: f64) -> RateLimiter {
        let mut overrides = HashMap::new();
        overrides.insert(
            class.to_string(),
            RateLimitConfig {
                capacity,
                refill_per_sec,
            },
        );
        RateLimiter::new(&overrides)
    }

    #[test]
    fn exhausts_then_refills() {
        let l = limiter("search", 2, 1.0);
        let t0 = Instant::now();
        assert!(l.check_at("alice", OpClass::Search, t0).is_ok());
        assert!(l.check_at("alice", OpClass::Search, t0).is_ok());
        assert!(matches!(
            l.check_at("alice", OpClass::Search, t0),
            Err(ApiError::RateLimited(_))
        ));
        assert!(l
            .check_at("alice", OpClass::Search, t0 + Duration::from_millis(1100))
            .is_ok());
    }

    #[test]
    fn callers_and_classes_are_independent() {
        let l = limiter("summarize", 1, 0.0);
        let t0 = Instant::now();
        assert!(l.check_at("alice", OpClass::Summarize, t0).is_ok());
        assert!(l.check_at("alice", OpClass::Summarize, t0).is_err());
        assert!(l.check_at("bob", OpClass::Summarize, t0).is_ok());
        assert!(l.check_at("alice", OpClass::Search, t0).is_ok());
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let l = limiter("preview", 3, 10.0);
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(3600);
        assert!(l.check_at("c", OpClass::Preview, t0).is_ok());
        for _ in 0..3 {
            assert!(l.check_at("c", OpClass::Preview, later).is_ok());
        }
        assert!(l.check_at("c", OpClass::Preview, later).is_err());
    }

    fn tracked(l: &RateLimiter) -> usize {
        l.buckets.lock().map.len()
    }

    #[test]
    fn idle_buckets_are_swept_over_time() {
        let l = limiter("search", 5, 1.0);
        let t0 = Instant::now();
        for i in 0..100 {
            assert!(l.check_at(&format!("c{}", i), OpClass::Search, t0).is_ok());
        }
        assert_eq!(tracked(&l), 100);

        let later = t0 + SWEEP_INTERVAL + Duration::from_secs(1);
        assert!(l.check_at("fresh", OpClass::Search, later).is_ok());
        assert_eq!(tracked(&l), 1);
    }

    #[test]
    fn bucket_count_never_exceeds_the_cap() {
        let l = limiter("summarize", 1, 0.0);
        let t0 = Instant::now();
        for i in 0..MAX_BUCKETS + 50 {
            let at = t0 + Duration::from_millis(i as u64);
            assert!(l.check_at(&format!("c{}", i), OpClass::Summarize, at).is_ok());
        }
        assert_eq!(tracked(&l), MAX_BUCKETS);
        // the newest callers are still limited
        let last = format!("c{}", MAX_BUCKETS + 49);
        assert!(l.check_at(&last, OpClass::Summarize, t0).is_err());
    }

    #[test]
    fn defaults_decrease_with_cost() {
        assert!(default_limit(OpClass::Search).capacity > default_limit(OpClass::Preview).capacity);
        assert!(default_limit(OpClass::Preview).capacity > default_limit(OpClass::Summarize).capacity);
    }
}
