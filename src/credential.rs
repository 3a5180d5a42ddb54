//! Read-only view of an upstream credential.
//!
//! The live credential list is owned by an external watcher that refreshes it
//! from configuration and the database; the core only reads and filters it
//! per request. `name` is the stable identity used for routing, sticky
//! bindings, and the usage log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Availability state of a credential, either globally or for one model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CooldownState {
    /// Administratively disabled at this scope.
    pub disabled: bool,
    /// Temporarily unavailable after an upstream failure.
    pub unavailable: bool,
    /// When the credential may be retried after a transient failure.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// The upstream reported an exhausted quota.
    pub quota_exceeded: bool,
    /// When the exhausted quota is expected to recover.
    pub quota_recover_at: Option<DateTime<Utc>>,
}

impl CooldownState {
    /// End of the active cooldown window, preferring the quota recovery time
    /// when it lies further in the future.
    pub fn cooldown_end(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let retry_at = self.next_retry_at?;
        if retry_at <= now {
            return None;
        }
        let mut end = retry_at;
        if let Some(recover_at) = self.quota_recover_at
            && recover_at > now
        {
            end = recover_at;
        }
        Some(end.max(now))
    }
}

/// An upstream credential eligible to service proxied calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credential {
    /// Stable identity: routing key, sticky-binding target, usage-log reference.
    pub name: String,
    pub provider: String,
    /// Administratively disabled for all models.
    pub disabled: bool,
    /// Global availability state, consulted when no per-model state exists.
    pub state: CooldownState,
    /// Per-model availability, keyed by upstream model name.
    pub model_states: HashMap<String, CooldownState>,
}

impl Credential {
    /// A plain enabled credential, used heavily in tests.
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            ..Self::default()
        }
    }
}
