//! Hybrid fixed-window rate limiting.
//!
//! [`Manager`] answers allow/deny for a key and a per-second limit. When a
//! Redis backend is configured it is tried first so multiple proxy instances
//! share one counter space; any connection or protocol error trips a
//! time-boxed circuit breaker and the in-process [`MemoryLimiter`] takes
//! over. The manager never returns an error: request routing must not
//! depend on limiter availability.

pub mod memory;
pub mod redis;
pub mod resolve;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{LimiterSettings, SettingsProvider};
use crate::types::{MappingId, UserId};

pub use memory::MemoryLimiter;
pub use redis::RedisLimiter;
pub use resolve::{LimitStore, resolve_limit};

/// How long the Redis backend is skipped after a failure.
const BREAKER_DURATION: Duration = Duration::from_secs(30);
/// Budget for establishing and probing a new Redis connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Budget for one Redis window check on the request path.
const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Calls left in the current window; zero when denied.
    pub remaining: i32,
    /// Start of the next window.
    pub reset: DateTime<Utc>,
}

impl RateLimitResult {
    /// Allow verdict for unlimited keys (no limit, or no key).
    pub fn unlimited(now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining: i32::MAX,
            reset: now,
        }
    }
}

/// Which dimension the resolved limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    /// One counter per user, across all models.
    User,
    /// One counter per (user, model mapping).
    Mapping,
}

/// The resolved rate limit for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitDecision {
    pub limit: i32,
    pub scope: LimitScope,
    pub mapping_id: Option<MappingId>,
}

impl LimitDecision {
    pub fn user(limit: i32) -> Self {
        Self {
            limit,
            scope: LimitScope::User,
            mapping_id: None,
        }
    }
}

/// Limiter key for a resolved decision; `None` when the decision cannot be
/// keyed (no positive limit, or mapping scope without a mapping id).
pub fn key_for_decision(user_id: UserId, decision: &LimitDecision) -> Option<String> {
    if user_id <= 0 || decision.limit <= 0 {
        return None;
    }
    match decision.scope {
        LimitScope::Mapping => {
            let mapping_id = decision.mapping_id.filter(|id| *id > 0)?;
            Some(format!("u:{user_id}:m:{mapping_id}"))
        }
        LimitScope::User => Some(format!("u:{user_id}")),
    }
}

/// Clock source, injectable for tests.
pub type ClockFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Redis connection parameters currently in effect.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct RedisTarget {
    addr: String,
    password: String,
    db: i64,
    prefix: String,
}

impl RedisTarget {
    fn from_settings(settings: &LimiterSettings) -> Self {
        Self {
            addr: settings.redis_addr.trim().to_string(),
            password: settings.redis_password.trim().to_string(),
            db: settings.redis_db.max(0),
            prefix: settings.redis_prefix.trim().to_string(),
        }
    }

    fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/{}", self.addr, self.db)
        } else {
            format!("redis://:{}@{}/{}", self.password, self.addr, self.db)
        }
    }
}

#[derive(Default)]
struct RedisState {
    limiter: Option<RedisLimiter>,
    target: RedisTarget,
    breaker_until: Option<DateTime<Utc>>,
}

/// Selects a limiter backend and enforces fixed-window limits.
pub struct Manager {
    settings: SettingsProvider,
    clock: ClockFn,
    memory: MemoryLimiter,
    redis: Mutex<RedisState>,
}

impl Manager {
    pub fn new(settings: SettingsProvider) -> Self {
        Self::with_clock(settings, Arc::new(Utc::now))
    }

    pub fn with_clock(settings: SettingsProvider, clock: ClockFn) -> Self {
        Self {
            settings,
            clock,
            memory: MemoryLimiter::new(),
            redis: Mutex::new(RedisState::default()),
        }
    }

    /// Checks whether the request should be allowed using the best available
    /// backend. A zero/negative limit or empty key always allows.
    pub async fn allow(&self, key: &str, limit: i32) -> RateLimitResult {
        let now = (self.clock)();
        if limit <= 0 || key.is_empty() {
            return RateLimitResult::unlimited(now);
        }
        let settings = (self.settings)();

        if settings.redis_enabled
            && let Some(result) = self.allow_redis(key, limit, now, &settings).await
        {
            return result;
        }
        self.memory.allow(key, limit, now)
    }

    /// `None` means "use the memory fallback": breaker open, connection
    /// failed, or the check itself errored.
    async fn allow_redis(
        &self,
        key: &str,
        limit: i32,
        now: DateTime<Utc>,
        settings: &LimiterSettings,
    ) -> Option<RateLimitResult> {
        let limiter = {
            let mut state = self.redis.lock().await;
            if let Some(until) = state.breaker_until {
                if now < until {
                    return None;
                }
                state.breaker_until = None;
            }
            match self.ensure_redis(&mut state, settings).await {
                Ok(limiter) => limiter,
                Err(err) => {
                    trip_breaker(&mut state, now, &err);
                    return None;
                }
            }
        };

        // The check runs outside the state lock; a shared multiplexed
        // connection carries concurrent calls. A stalled backend counts as a
        // failure so the request path never blocks on it.
        match bounded_check(limiter.allow(key, limit, now)).await {
            Ok(result) => Some(result),
            Err(err) => {
                let mut state = self.redis.lock().await;
                trip_breaker(&mut state, now, &err);
                None
            }
        }
    }

    /// Returns the current Redis limiter, reconnecting when the connection
    /// parameters changed. Reconnection is idempotent: an unchanged target
    /// reuses the existing connection, and replaced connections are dropped
    /// (closing them once in-flight clones finish).
    async fn ensure_redis(&self, state: &mut RedisState, settings: &LimiterSettings) -> anyhow::Result<RedisLimiter> {
        let target = RedisTarget::from_settings(settings);
        if target.addr.is_empty() {
            anyhow::bail!("rate limit redis: missing address");
        }
        if let Some(limiter) = &state.limiter
            && state.target == target
        {
            return Ok(limiter.clone());
        }
        state.limiter = None;

        let client = ::redis::Client::open(target.url())?;
        let mut conn = tokio::time::timeout(CONNECT_TIMEOUT, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| anyhow::anyhow!("rate limit redis: connect timed out"))??;
        // Probe before first use so a half-open backend trips the breaker
        // here instead of failing every window check.
        let pong: String = tokio::time::timeout(CONNECT_TIMEOUT, ::redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| anyhow::anyhow!("rate limit redis: ping timed out"))??;
        debug!(response = %pong, addr = %target.addr, "rate limit: redis connected");

        let limiter = RedisLimiter::new(conn, target.prefix.clone());
        state.limiter = Some(limiter.clone());
        state.target = target;
        Ok(limiter)
    }

    #[cfg(test)]
    async fn breaker_active(&self) -> bool {
        let state = self.redis.lock().await;
        state.breaker_until.is_some_and(|until| (self.clock)() < until)
    }
}

/// Bounds a Redis call so a stalled server fails the check instead of
/// holding up the caller.
async fn bounded_check<T, E>(fut: impl Future<Output = std::result::Result<T, E>>) -> anyhow::Result<T>
where
    E: Into<anyhow::Error>,
{
    match tokio::time::timeout(CHECK_TIMEOUT, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(anyhow::anyhow!("rate limit redis: window check timed out")),
    }
}

fn trip_breaker(state: &mut RedisState, now: DateTime<Utc>, err: &anyhow::Error) {
    if state.breaker_until.is_some_and(|until| now < until) {
        return;
    }
    state.breaker_until = now.checked_add_signed(chrono::Duration::from_std(BREAKER_DURATION).unwrap_or_default());
    warn!(error = %err, "rate limit: redis unavailable, falling back to memory");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixed_settings;
    use chrono::TimeZone;

    fn fixed_clock(sec: i64) -> ClockFn {
        Arc::new(move || Utc.timestamp_opt(sec, 0).unwrap())
    }

    #[test]
    fn key_formats_follow_scope() {
        assert_eq!(key_for_decision(7, &LimitDecision::user(3)), Some("u:7".to_string()));
        let mapping = LimitDecision {
            limit: 3,
            scope: LimitScope::Mapping,
            mapping_id: Some(12),
        };
        assert_eq!(key_for_decision(7, &mapping), Some("u:7:m:12".to_string()));
    }

    #[test]
    fn unkeyable_decisions_yield_none() {
        assert_eq!(key_for_decision(0, &LimitDecision::user(3)), None);
        assert_eq!(key_for_decision(7, &LimitDecision::user(0)), None);
        let missing_mapping = LimitDecision {
            limit: 3,
            scope: LimitScope::Mapping,
            mapping_id: None,
        };
        assert_eq!(key_for_decision(7, &missing_mapping), None);
    }

    #[tokio::test]
    async fn memory_backend_enforces_window() {
        let manager = Manager::with_clock(fixed_settings(LimiterSettings::default()), fixed_clock(1_000));
        assert!(manager.allow("u:1", 1).await.allowed);
        assert!(!manager.allow("u:1", 1).await.allowed);
    }

    #[tokio::test]
    async fn zero_limit_always_allows() {
        let manager = Manager::with_clock(fixed_settings(LimiterSettings::default()), fixed_clock(1_000));
        for _ in 0..5 {
            assert!(manager.allow("u:1", 0).await.allowed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_window_check_fails_instead_of_hanging() {
        let stalled = std::future::pending::<std::result::Result<RateLimitResult, std::io::Error>>();
        let result = bounded_check(stalled).await;
        assert!(result.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn unreachable_redis_fails_open_and_trips_breaker() {
        let settings = LimiterSettings {
            redis_enabled: true,
            // Reserved port: connection refused immediately.
            redis_addr: "127.0.0.1:1".into(),
            ..LimiterSettings::default()
        };
        let manager = Manager::with_clock(fixed_settings(settings), fixed_clock(1_000));

        // Decision still comes back, served by the memory fallback.
        assert!(manager.allow("u:1", 1).await.allowed);
        assert!(manager.breaker_active().await);
        // Within the breaker window the memory backend keeps the count.
        assert!(!manager.allow("u:1", 1).await.allowed);
    }
}
