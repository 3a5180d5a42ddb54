//! Availability filtering for the candidate credential pool.
//!
//! Pure functions over the per-request candidate slice: no clock reads, no
//! store access. The caller supplies `now` so outcomes are deterministic.

use chrono::{DateTime, Utc};

use crate::credential::{CooldownState, Credential};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockReason {
    /// Quota-exceeded cooldown; counted separately so an all-cooling pool
    /// can report a precise retry time.
    QuotaCooldown,
    Disabled,
    Other,
}

/// Result of filtering a candidate pool for one model.
#[derive(Debug)]
pub struct AvailabilityOutcome<'a> {
    /// Survivors, sorted by name for deterministic strategy input.
    pub available: Vec<&'a Credential>,
    /// How many candidates were dropped for a quota-exceeded cooldown.
    pub quota_cooldown_count: usize,
    /// Earliest cooldown end among the quota-cooling candidates.
    pub earliest_recovery: Option<DateTime<Utc>>,
}

/// Drops candidates that are disabled or in an active cooldown for `model`.
pub fn filter_available<'a>(candidates: &'a [Credential], model: &str, now: DateTime<Utc>) -> AvailabilityOutcome<'a> {
    let mut available = Vec::with_capacity(candidates.len());
    let mut quota_cooldown_count = 0;
    let mut earliest_recovery: Option<DateTime<Utc>> = None;

    for candidate in candidates {
        match block_state(candidate, model, now) {
            None => available.push(candidate),
            Some((BlockReason::QuotaCooldown, next)) => {
                quota_cooldown_count += 1;
                if let Some(next) = next
                    && earliest_recovery.is_none_or(|earliest| next < earliest)
                {
                    earliest_recovery = Some(next);
                }
            }
            Some(_) => {}
        }
    }

    if available.len() > 1 {
        available.sort_by(|a, b| a.name.cmp(&b.name));
    }

    AvailabilityOutcome {
        available,
        quota_cooldown_count,
        earliest_recovery,
    }
}

/// `None` when the credential may serve the model; otherwise the reason and,
/// for cooldowns, when the credential becomes eligible again.
fn block_state(
    credential: &Credential,
    model: &str,
    now: DateTime<Utc>,
) -> Option<(BlockReason, Option<DateTime<Utc>>)> {
    if credential.disabled {
        return Some((BlockReason::Disabled, None));
    }
    if !model.is_empty() {
        // Per-model state overrides the global one; a credential with no
        // entry for this model is considered available.
        let Some(state) = credential.model_states.get(model) else {
            return None;
        };
        return state_block(state, now);
    }
    state_block(&credential.state, now)
}

fn state_block(state: &CooldownState, now: DateTime<Utc>) -> Option<(BlockReason, Option<DateTime<Utc>>)> {
    if state.disabled {
        return Some((BlockReason::Disabled, None));
    }
    if !state.unavailable {
        return None;
    }
    let end = state.cooldown_end(now)?;
    let reason = if state.quota_exceeded {
        BlockReason::QuotaCooldown
    } else {
        BlockReason::Other
    };
    Some((reason, Some(end)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn cooling(name: &str, model: &str, quota_exceeded: bool, ends_in: Duration, now: DateTime<Utc>) -> Credential {
        let mut credential = Credential::new(name, "openai");
        credential.model_states.insert(
            model.to_string(),
            CooldownState {
                unavailable: true,
                next_retry_at: Some(now + ends_in),
                quota_exceeded,
                ..CooldownState::default()
            },
        );
        credential
    }

    #[test]
    fn survivors_are_sorted_by_name() {
        let now = Utc::now();
        let pool = vec![
            Credential::new("charlie", "openai"),
            Credential::new("alice", "openai"),
            Credential::new("bob", "openai"),
        ];
        let outcome = filter_available(&pool, "gpt-4o", now);
        let names: Vec<_> = outcome.available.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob", "charlie"]);
    }

    #[test]
    fn disabled_and_cooling_candidates_are_dropped() {
        let now = Utc::now();
        let mut disabled = Credential::new("a", "openai");
        disabled.disabled = true;
        let pool = vec![
            disabled,
            cooling("b", "gpt-4o", false, Duration::seconds(30), now),
            Credential::new("c", "openai"),
        ];
        let outcome = filter_available(&pool, "gpt-4o", now);
        assert_eq!(outcome.available.len(), 1);
        assert_eq!(outcome.available[0].name, "c");
        assert_eq!(outcome.quota_cooldown_count, 0);
    }

    #[test]
    fn quota_cooldowns_report_the_earliest_recovery() {
        let now = Utc::now();
        let pool = vec![
            cooling("a", "gpt-4o", true, Duration::seconds(90), now),
            cooling("b", "gpt-4o", true, Duration::seconds(30), now),
        ];
        let outcome = filter_available(&pool, "gpt-4o", now);
        assert!(outcome.available.is_empty());
        assert_eq!(outcome.quota_cooldown_count, 2);
        assert_eq!(outcome.earliest_recovery, Some(now + Duration::seconds(30)));
    }

    #[test]
    fn expired_cooldown_is_available_again() {
        let now = Utc::now();
        let pool = vec![cooling("a", "gpt-4o", true, Duration::seconds(-5), now)];
        let outcome = filter_available(&pool, "gpt-4o", now);
        assert_eq!(outcome.available.len(), 1);
    }

    #[test]
    fn quota_recovery_extends_the_cooldown_end() {
        let now = Utc::now();
        let mut credential = Credential::new("a", "openai");
        credential.model_states.insert(
            "gpt-4o".to_string(),
            CooldownState {
                unavailable: true,
                next_retry_at: Some(now + Duration::seconds(10)),
                quota_exceeded: true,
                quota_recover_at: Some(now + Duration::seconds(60)),
                ..CooldownState::default()
            },
        );
        let pool = [credential];
        let outcome = filter_available(&pool, "gpt-4o", now);
        assert_eq!(outcome.earliest_recovery, Some(now + Duration::seconds(60)));
    }

    #[test]
    fn model_without_state_falls_through_to_available() {
        let now = Utc::now();
        let credential = cooling("a", "other-model", true, Duration::seconds(30), now);
        let pool = [credential];
        let outcome = filter_available(&pool, "gpt-4o", now);
        assert_eq!(outcome.available.len(), 1);
    }
}
