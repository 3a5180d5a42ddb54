//! Redis-backed fixed-window limiter.
//!
//! Counters live under `prefix:key:unix_second`. The increment and the
//! first-increment expiry run as one Lua script, so two proxy instances
//! cannot race between the check and the act. The expiry is one second
//! longer than the window to tolerate clock skew between instances; keys
//! self-clean without a sweep.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use redis::{Script, aio::MultiplexedConnection};

use super::RateLimitResult;

/// Window length plus one second of skew tolerance.
const WINDOW_TTL_SECONDS: i64 = 2;

const INCR_SCRIPT: &str = r#"
local current = redis.call("INCR", KEYS[1])
if current == 1 then
  redis.call("EXPIRE", KEYS[1], ARGV[1])
end
return current
"#;

#[derive(Clone)]
pub struct RedisLimiter {
    conn: MultiplexedConnection,
    prefix: String,
    script: Arc<Script>,
}

impl RedisLimiter {
    pub fn new(conn: MultiplexedConnection, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into().trim().to_string(),
            script: Arc::new(Script::new(INCR_SCRIPT)),
        }
    }

    /// Checks whether the request is allowed in the current second.
    pub async fn allow(&self, key: &str, limit: i32, now: DateTime<Utc>) -> Result<RateLimitResult, redis::RedisError> {
        if limit <= 0 || key.is_empty() {
            return Ok(RateLimitResult::unlimited(now));
        }
        let sec = now.timestamp();
        let reset = DateTime::<Utc>::from_timestamp(sec + 1, 0).unwrap_or(now);

        let mut conn = self.conn.clone();
        let count: i64 = self
            .script
            .key(self.window_key(key, sec))
            .arg(WINDOW_TTL_SECONDS)
            .invoke_async(&mut conn)
            .await?;

        if count > i64::from(limit) {
            return Ok(RateLimitResult {
                allowed: false,
                remaining: 0,
                reset,
            });
        }
        let remaining = i32::try_from(i64::from(limit) - count).unwrap_or(0).max(0);
        Ok(RateLimitResult {
            allowed: true,
            remaining,
            reset,
        })
    }

    fn window_key(&self, key: &str, sec: i64) -> String {
        if self.prefix.is_empty() {
            format!("{key}:{sec}")
        } else {
            format!("{}:{key}:{sec}", self.prefix)
        }
    }
}
