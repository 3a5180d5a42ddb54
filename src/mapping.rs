//! Model-mapping snapshot.
//!
//! The mapping table (provider + upstream model name → client-visible alias,
//! routing strategy, per-mapping rate limit) is refreshed out-of-band by the
//! config watcher. Readers go through an immutable snapshot behind an
//! [`ArcSwap`]: the watcher builds a complete index and publishes it in one
//! store, so readers never block and never observe a partial update.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::MappingId;

/// How the selector chooses among available credentials for a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStrategy {
    #[default]
    RoundRobin,
    FillFirst,
    Sticky,
}

/// One row of the mapping table, as supplied by the watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMappingRow {
    pub id: MappingId,
    pub provider: String,
    /// Upstream model name.
    pub model_name: String,
    /// Client-visible alias.
    pub alias: String,
    pub strategy: RouteStrategy,
    /// Calls per second; zero means no per-mapping limit.
    pub rate_limit: i32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy)]
struct RouteEntry {
    id: MappingId,
    strategy: RouteStrategy,
    rate_limit: i32,
}

#[derive(Debug, Clone)]
struct AliasEntry {
    id: MappingId,
    alias: String,
}

#[derive(Debug, Default)]
struct Snapshot {
    updated_at: Option<DateTime<Utc>>,
    /// Keyed by (provider, alias): requests address mappings by alias first.
    by_alias: HashMap<(String, String), RouteEntry>,
    /// Keyed by (provider, upstream model name).
    by_model: HashMap<(String, String), RouteEntry>,
    /// Lowercased (provider, model name) → alias, for usage logging.
    alias_by_model: HashMap<(String, String), AliasEntry>,
}

fn route_key(provider: &str, model: &str) -> (String, String) {
    (provider.trim().to_owned(), model.trim().to_owned())
}

fn lower_key(provider: &str, model: &str) -> (String, String) {
    (
        provider.trim().to_lowercase(),
        model.trim().to_lowercase(),
    )
}

/// Atomically swapped index over the mapping table.
#[derive(Default)]
pub struct ModelMappings {
    snapshot: ArcSwap<Snapshot>,
}

impl ModelMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the snapshot wholesale. Disabled rows are skipped; on key
    /// collisions the highest mapping id wins.
    pub fn store(&self, updated_at: DateTime<Utc>, rows: &[ModelMappingRow]) {
        let mut next = Snapshot {
            updated_at: Some(updated_at),
            ..Snapshot::default()
        };

        for row in rows {
            if !row.enabled {
                continue;
            }
            let provider = row.provider.trim();
            if provider.is_empty() {
                continue;
            }
            let entry = RouteEntry {
                id: row.id,
                strategy: row.strategy,
                rate_limit: row.rate_limit,
            };
            let alias = row.alias.trim();
            let model = row.model_name.trim();
            if !alias.is_empty() {
                let key = route_key(provider, alias);
                if next.by_alias.get(&key).is_none_or(|prev| row.id > prev.id) {
                    next.by_alias.insert(key, entry);
                }
            }
            if !model.is_empty() {
                let key = route_key(provider, model);
                if next.by_model.get(&key).is_none_or(|prev| row.id > prev.id) {
                    next.by_model.insert(key, entry);
                }
                if !alias.is_empty() {
                    let key = lower_key(provider, model);
                    if next
                        .alias_by_model
                        .get(&key)
                        .is_none_or(|prev| row.id > prev.id)
                    {
                        next.alias_by_model.insert(
                            key,
                            AliasEntry {
                                id: row.id,
                                alias: alias.to_owned(),
                            },
                        );
                    }
                }
            }
        }

        self.snapshot.store(Arc::new(next));
    }

    fn lookup(&self, provider: &str, model: &str) -> Option<RouteEntry> {
        let provider = provider.trim();
        let model = model.trim();
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        let snap = self.snapshot.load();
        let key = route_key(provider, model);
        snap.by_alias
            .get(&key)
            .or_else(|| snap.by_model.get(&key))
            .copied()
    }

    /// Routing strategy for a provider + model, looked up by alias first.
    pub fn strategy(&self, provider: &str, model: &str) -> Option<(MappingId, RouteStrategy)> {
        self.lookup(provider, model).map(|e| (e.id, e.strategy))
    }

    /// Per-mapping rate limit for a provider + model, if one is configured.
    pub fn rate_limit(&self, provider: &str, model: &str) -> Option<(MappingId, i32)> {
        self.lookup(provider, model).map(|e| (e.id, e.rate_limit))
    }

    /// Client-visible alias for an upstream model name, if mapped.
    pub fn mapped_alias(&self, provider: &str, model: &str) -> Option<String> {
        let provider = provider.trim();
        let model = model.trim();
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        let snap = self.snapshot.load();
        snap.alias_by_model
            .get(&lower_key(provider, model))
            .map(|entry| entry.alias.clone())
            .filter(|alias| !alias.is_empty())
    }

    /// When the current snapshot was published, if ever.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot.load().updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: MappingId, model: &str, alias: &str, strategy: RouteStrategy) -> ModelMappingRow {
        ModelMappingRow {
            id,
            provider: "openai".into(),
            model_name: model.into(),
            alias: alias.into(),
            strategy,
            rate_limit: 5,
            enabled: true,
        }
    }

    #[test]
    fn alias_key_takes_precedence_over_model_key() {
        let mappings = ModelMappings::new();
        mappings.store(
            Utc::now(),
            &[
                row(1, "gpt-4o-2024-11-20", "gpt-4o", RouteStrategy::Sticky),
                row(2, "gpt-4o", "fast", RouteStrategy::FillFirst),
            ],
        );
        // "gpt-4o" matches row 1 by alias even though row 2 matches by model name.
        assert_eq!(
            mappings.strategy("openai", "gpt-4o"),
            Some((1, RouteStrategy::Sticky))
        );
    }

    #[test]
    fn highest_id_wins_on_duplicate_keys() {
        let mappings = ModelMappings::new();
        mappings.store(
            Utc::now(),
            &[
                row(3, "gpt-4o", "gpt-4o", RouteStrategy::RoundRobin),
                row(7, "gpt-4o", "gpt-4o", RouteStrategy::Sticky),
                row(5, "gpt-4o", "gpt-4o", RouteStrategy::FillFirst),
            ],
        );
        assert_eq!(
            mappings.strategy("openai", "gpt-4o"),
            Some((7, RouteStrategy::Sticky))
        );
    }

    #[test]
    fn disabled_rows_and_unknown_models_miss() {
        let mappings = ModelMappings::new();
        let mut disabled = row(1, "gpt-4o", "fast", RouteStrategy::Sticky);
        disabled.enabled = false;
        mappings.store(Utc::now(), &[disabled]);
        assert_eq!(mappings.strategy("openai", "fast"), None);
        assert_eq!(mappings.rate_limit("openai", "missing"), None);
    }

    #[test]
    fn alias_lookup_is_case_insensitive() {
        let mappings = ModelMappings::new();
        mappings.store(
            Utc::now(),
            &[row(1, "GPT-4o", "fast", RouteStrategy::RoundRobin)],
        );
        assert_eq!(
            mappings.mapped_alias("OpenAI", "gpt-4O"),
            Some("fast".to_string())
        );
    }

    #[test]
    fn store_replaces_previous_snapshot_wholesale() {
        let mappings = ModelMappings::new();
        mappings.store(Utc::now(), &[row(1, "a", "a", RouteStrategy::RoundRobin)]);
        mappings.store(Utc::now(), &[row(2, "b", "b", RouteStrategy::RoundRobin)]);
        assert_eq!(mappings.strategy("openai", "a"), None);
        assert!(mappings.strategy("openai", "b").is_some());
    }
}
