//! Credential selection.
//!
//! [`Selector::pick`] turns a per-request candidate pool into one admitted
//! credential: filter out disabled and cooling candidates, apply the
//! mapping's routing strategy, then enforce the caller's rate limit. Store
//! degradation never rejects a request; only an exhausted pool or an
//! exceeded limit does.

pub mod availability;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::{
    config::SettingsProvider,
    credential::Credential,
    errors::{Error, Result},
    mapping::{ModelMappings, RouteStrategy},
    ratelimit::{ClockFn, LimitStore, Manager, key_for_decision, resolve_limit},
    types::{CredentialRowId, MappingId, RequestMeta, UserId},
};

use availability::filter_available;

/// Store reads and writes the routing strategies need.
///
/// Implemented by [`crate::db::PgStore`]; tests substitute in-memory fakes.
#[async_trait]
pub trait SelectorStore: Send + Sync {
    /// Row ids for the named credentials; missing names are absent from the map.
    async fn credential_row_ids(&self, names: &[String]) -> crate::db::errors::Result<HashMap<String, CredentialRowId>>;

    /// The credential a user is bound to for a mapping, if any.
    async fn sticky_binding(&self, user_id: UserId, mapping_id: MappingId) -> crate::db::errors::Result<Option<String>>;

    /// Creates or refreshes the user's binding for a mapping.
    async fn bind_sticky(
        &self,
        user_id: UserId,
        mapping_id: MappingId,
        credential_name: &str,
    ) -> crate::db::errors::Result<()>;

    /// Per-credential request counts for a user, provider and model.
    async fn usage_counts(
        &self,
        user_id: UserId,
        provider: &str,
        model: &str,
        names: &[String],
    ) -> crate::db::errors::Result<HashMap<String, i64>>;
}

/// Picks one credential per request and gates it on the caller's rate limit.
pub struct Selector {
    store: Arc<dyn SelectorStore>,
    limit_store: Arc<dyn LimitStore>,
    mappings: Arc<ModelMappings>,
    limiter: Arc<Manager>,
    settings: SettingsProvider,
    clock: ClockFn,
    /// Round-robin cursor, shared by every mapping using that strategy.
    cursor: AtomicU64,
}

impl Selector {
    pub fn new(
        store: Arc<dyn SelectorStore>,
        limit_store: Arc<dyn LimitStore>,
        mappings: Arc<ModelMappings>,
        limiter: Arc<Manager>,
        settings: SettingsProvider,
    ) -> Self {
        Self::with_clock(store, limit_store, mappings, limiter, settings, Arc::new(Utc::now))
    }

    pub fn with_clock(
        store: Arc<dyn SelectorStore>,
        limit_store: Arc<dyn LimitStore>,
        mappings: Arc<ModelMappings>,
        limiter: Arc<Manager>,
        settings: SettingsProvider,
        clock: ClockFn,
    ) -> Self {
        Self {
            store,
            limit_store,
            mappings,
            limiter,
            settings,
            clock,
            cursor: AtomicU64::new(0),
        }
    }

    /// Selects a credential for the request, or explains why none is usable.
    #[instrument(skip(self, meta, candidates), fields(pool = candidates.len()))]
    pub async fn pick(
        &self,
        meta: &RequestMeta,
        provider: &str,
        model: &str,
        candidates: &[Credential],
    ) -> Result<Credential> {
        let now = (self.clock)();
        if candidates.is_empty() {
            return Err(Error::NoCredentials {
                provider: provider.to_string(),
                model: model.to_string(),
            });
        }

        let outcome = filter_available(candidates, model, now);
        if outcome.available.is_empty() {
            // Distinguish "everything is cooling down" from "nothing usable":
            // the former carries a concrete retry time.
            if outcome.quota_cooldown_count == candidates.len()
                && let Some(recovery) = outcome.earliest_recovery
            {
                return Err(Error::ModelCooldown {
                    provider: provider.to_string(),
                    model: model.to_string(),
                    reset_in: (recovery - now).to_std().unwrap_or_default(),
                });
            }
            return Err(Error::NoCredentials {
                provider: provider.to_string(),
                model: model.to_string(),
            });
        }

        let route = self.mappings.strategy(provider, model);
        let strategy = route.map(|(_, s)| s).unwrap_or_default();
        let mapping_id = route.map(|(id, _)| id);

        let selected = match strategy {
            RouteStrategy::RoundRobin => self.pick_round_robin(&outcome.available),
            RouteStrategy::FillFirst => self.pick_fill_first(&outcome.available).await,
            RouteStrategy::Sticky => self.pick_sticky(meta, provider, model, mapping_id, &outcome.available).await,
        };
        debug!(credential = %selected.name, ?strategy, "credential selected");

        self.apply_rate_limit(meta, provider, model, &selected.name, now).await?;
        Ok(selected.clone())
    }

    fn pick_round_robin<'a>(&self, available: &[&'a Credential]) -> &'a Credential {
        if available.len() == 1 {
            return available[0];
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % available.len();
        available[index]
    }

    /// Routes to the longest-standing credential (lowest row id), so later
    /// additions stay idle until the earlier ones become unavailable.
    async fn pick_fill_first<'a>(&self, available: &[&'a Credential]) -> &'a Credential {
        if available.len() == 1 {
            return available[0];
        }
        let names: Vec<String> = available.iter().map(|c| c.name.clone()).collect();
        let ids = match self.store.credential_row_ids(&names).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "fill-first: row id lookup failed, using first available");
                return available[0];
            }
        };
        let mut best = available[0];
        let mut best_id = row_id_or_max(&ids, best);
        for candidate in available[1..].iter().copied() {
            let id = row_id_or_max(&ids, candidate);
            if id < best_id {
                best = candidate;
                best_id = id;
            }
        }
        best
    }

    /// Reuses the user's stored binding when it is still available; otherwise
    /// binds the least-used available credential. Any store failure degrades
    /// to round-robin rather than rejecting the request.
    async fn pick_sticky<'a>(
        &self,
        meta: &RequestMeta,
        provider: &str,
        model: &str,
        mapping_id: Option<MappingId>,
        available: &[&'a Credential],
    ) -> &'a Credential {
        let Some(mapping_id) = mapping_id.filter(|id| *id > 0) else {
            return self.pick_round_robin(available);
        };
        let Some(user_id) = meta.user_id.filter(|id| *id > 0) else {
            return self.pick_round_robin(available);
        };

        match self.store.sticky_binding(user_id, mapping_id).await {
            Ok(Some(bound)) => {
                if let Some(found) = available.iter().copied().find(|c| c.name.eq_ignore_ascii_case(&bound)) {
                    return found;
                }
                // Bound credential is cooling or gone; fall through and rebind.
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, user_id, mapping_id, "sticky: binding lookup failed, using round-robin");
                return self.pick_round_robin(available);
            }
        }

        let names: Vec<String> = available.iter().map(|c| c.name.clone()).collect();
        let counts = match self.store.usage_counts(user_id, provider, model, &names).await {
            Ok(counts) => counts,
            Err(err) => {
                warn!(error = %err, user_id, "sticky: usage lookup failed, using round-robin");
                return self.pick_round_robin(available);
            }
        };

        // Ties resolve to the first candidate in name order, keeping the
        // choice stable across calls.
        let mut best = available[0];
        let mut best_count = counts.get(&best.name).copied().unwrap_or(0);
        for candidate in available[1..].iter().copied() {
            let count = counts.get(&candidate.name).copied().unwrap_or(0);
            if count < best_count {
                best = candidate;
                best_count = count;
            }
        }

        if let Err(err) = self.store.bind_sticky(user_id, mapping_id, &best.name).await {
            warn!(error = %err, user_id, mapping_id, "sticky: binding upsert failed");
        }
        best
    }

    /// Enforces the resolved per-second limit for rate-limited callers.
    /// Resolution or limiter trouble logs and admits the request.
    async fn apply_rate_limit(
        &self,
        meta: &RequestMeta,
        provider: &str,
        model: &str,
        credential_name: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !meta.rate_limited {
            return Ok(());
        }
        let Some(user_id) = meta.user_id.filter(|id| *id > 0) else {
            return Ok(());
        };

        let settings = (self.settings)();
        let decision = match resolve_limit(
            self.limit_store.as_ref(),
            &self.mappings,
            settings.default_limit,
            user_id,
            provider,
            model,
            credential_name,
            now,
        )
        .await
        {
            Ok(decision) => decision,
            Err(err) => {
                warn!(error = %err, user_id, "rate limit resolution failed, admitting request");
                return Ok(());
            }
        };
        let Some(decision) = decision else {
            return Ok(());
        };
        let Some(key) = key_for_decision(user_id, &decision) else {
            return Ok(());
        };

        let result = self.limiter.allow(&key, decision.limit).await;
        if !result.allowed {
            return Err(Error::RateLimited {
                reset_in: (result.reset - now).to_std().unwrap_or_default(),
            });
        }
        Ok(())
    }
}

fn row_id_or_max(ids: &HashMap<String, CredentialRowId>, credential: &Credential) -> CredentialRowId {
    ids.get(&credential.name).copied().unwrap_or(CredentialRowId::MAX)
}
