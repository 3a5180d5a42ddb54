//! In-process fixed-window limiter.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::RateLimitResult;

struct WindowEntry {
    /// Wall-clock second the counter belongs to.
    window: i64,
    count: i32,
}

/// Fixed one-second-window counter table guarded by a single mutex.
///
/// Window rollover is lazy: the counter resets on first access within a new
/// second, so no background sweep is needed. Entries for idle keys linger
/// but are reset on next use.
#[derive(Default)]
pub struct MemoryLimiter {
    counters: Mutex<HashMap<String, WindowEntry>>,
}

impl MemoryLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks whether the request is allowed in the current second.
    pub fn allow(&self, key: &str, limit: i32, now: DateTime<Utc>) -> RateLimitResult {
        if limit <= 0 || key.is_empty() {
            return RateLimitResult::unlimited(now);
        }
        let sec = now.timestamp();
        let reset = DateTime::<Utc>::from_timestamp(sec + 1, 0).unwrap_or(now);

        let mut counters = self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = counters.entry(key.to_string()).or_insert(WindowEntry { window: sec, count: 0 });
        if entry.window != sec {
            entry.window = sec;
            entry.count = 0;
        }
        if entry.count >= limit {
            return RateLimitResult {
                allowed: false,
                remaining: 0,
                reset,
            };
        }
        entry.count += 1;
        RateLimitResult {
            allowed: true,
            remaining: limit - entry.count,
            reset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(sec: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(sec, 0).unwrap()
    }

    #[test]
    fn denies_past_limit_within_one_second() {
        let limiter = MemoryLimiter::new();
        let now = at(1_000);

        let first = limiter.allow("k", 1, now);
        assert!(first.allowed);
        assert_eq!(first.remaining, 0);

        let second = limiter.allow("k", 1, now);
        assert!(!second.allowed);
        assert_eq!(second.remaining, 0);
        assert_eq!(second.reset, at(1_001));
    }

    #[test]
    fn window_rolls_over_lazily() {
        let limiter = MemoryLimiter::new();
        assert!(limiter.allow("k", 1, at(1_000)).allowed);
        assert!(!limiter.allow("k", 1, at(1_000)).allowed);
        // The next second starts a fresh window without any sweep.
        assert!(limiter.allow("k", 1, at(1_001)).allowed);
    }

    #[test]
    fn zero_limit_or_empty_key_always_allows() {
        let limiter = MemoryLimiter::new();
        assert!(limiter.allow("k", 0, at(1_000)).allowed);
        assert!(limiter.allow("", 1, at(1_000)).allowed);
        assert!(limiter.allow("k", -1, at(1_000)).allowed);
    }

    #[test]
    fn keys_are_limited_independently() {
        let limiter = MemoryLimiter::new();
        let now = at(1_000);
        assert!(limiter.allow("a", 1, now).allowed);
        assert!(limiter.allow("b", 1, now).allowed);
        assert!(!limiter.allow("a", 1, now).allowed);
    }
}
