//! Rate-limit resolution: which limit applies, and at what scope.
//!
//! The chain checks, in priority order: active subscription bills, the model
//! mapping, the user, the user's group, the credential, the credential's
//! group, and finally the settings default. A zero at any level means
//! "unset, keep looking", not "unlimited".

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    db::errors::Result,
    mapping::ModelMappings,
    ratelimit::{LimitDecision, LimitScope},
    types::{GroupId, UserId},
};

/// Store reads needed by the resolution chain.
///
/// Implemented by [`crate::db::PgStore`]; tests substitute in-memory fakes.
#[async_trait]
pub trait LimitStore: Send + Sync {
    /// Sum of rate limits across the user's active, enabled, paid bills.
    async fn bill_rate_limit_sum(&self, user_id: UserId, now: DateTime<Utc>) -> Result<i32>;

    /// The user's individual limit and group membership; `None` for missing users.
    async fn user_rate_limit(&self, user_id: UserId) -> Result<Option<(i32, Option<GroupId>)>>;

    async fn user_group_rate_limit(&self, group_id: GroupId) -> Result<i32>;

    /// A credential's individual limit and group membership, by name.
    async fn credential_rate_limit(&self, credential_name: &str) -> Result<Option<(i32, Option<GroupId>)>>;

    async fn credential_group_rate_limit(&self, group_id: GroupId) -> Result<i32>;
}

/// Resolves the effective limit for one request. Returns `None` when no
/// level of the chain sets a positive limit.
pub async fn resolve_limit(
    store: &dyn LimitStore,
    mappings: &ModelMappings,
    default_limit: i32,
    user_id: UserId,
    provider: &str,
    model: &str,
    credential_name: &str,
    now: DateTime<Utc>,
) -> Result<Option<LimitDecision>> {
    let bill_limit = store.bill_rate_limit_sum(user_id, now).await?;
    if bill_limit > 0 {
        return Ok(Some(LimitDecision::user(bill_limit)));
    }

    if let Some((mapping_id, mapping_limit)) = mappings.rate_limit(provider, model)
        && mapping_limit > 0
        && mapping_id > 0
    {
        return Ok(Some(LimitDecision {
            limit: mapping_limit,
            scope: LimitScope::Mapping,
            mapping_id: Some(mapping_id),
        }));
    }

    let mut user_group = None;
    if let Some((user_limit, group_id)) = store.user_rate_limit(user_id).await? {
        if user_limit > 0 {
            return Ok(Some(LimitDecision::user(user_limit)));
        }
        user_group = group_id;
    }
    if let Some(group_id) = user_group.filter(|id| *id > 0) {
        let group_limit = store.user_group_rate_limit(group_id).await?;
        if group_limit > 0 {
            return Ok(Some(LimitDecision::user(group_limit)));
        }
    }

    let credential_name = credential_name.trim();
    let mut credential_group = None;
    if !credential_name.is_empty()
        && let Some((credential_limit, group_id)) = store.credential_rate_limit(credential_name).await?
    {
        if credential_limit > 0 {
            return Ok(Some(LimitDecision::user(credential_limit)));
        }
        credential_group = group_id;
    }
    if let Some(group_id) = credential_group.filter(|id| *id > 0) {
        let group_limit = store.credential_group_rate_limit(group_id).await?;
        if group_limit > 0 {
            return Ok(Some(LimitDecision::user(group_limit)));
        }
    }

    if default_limit > 0 {
        return Ok(Some(LimitDecision::user(default_limit)));
    }
    Ok(None)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mapping::{ModelMappingRow, RouteStrategy};
    use std::collections::HashMap;

    /// In-memory stand-in for the relational limit lookups.
    #[derive(Default)]
    pub(crate) struct FakeLimitStore {
        pub bill_sum: i32,
        pub users: HashMap<UserId, (i32, Option<GroupId>)>,
        pub user_groups: HashMap<GroupId, i32>,
        pub credentials: HashMap<String, (i32, Option<GroupId>)>,
        pub credential_groups: HashMap<GroupId, i32>,
    }

    #[async_trait]
    impl LimitStore for FakeLimitStore {
        async fn bill_rate_limit_sum(&self, _user_id: UserId, _now: DateTime<Utc>) -> Result<i32> {
            Ok(self.bill_sum)
        }

        async fn user_rate_limit(&self, user_id: UserId) -> Result<Option<(i32, Option<GroupId>)>> {
            Ok(self.users.get(&user_id).copied())
        }

        async fn user_group_rate_limit(&self, group_id: GroupId) -> Result<i32> {
            Ok(self.user_groups.get(&group_id).copied().unwrap_or(0))
        }

        async fn credential_rate_limit(&self, credential_name: &str) -> Result<Option<(i32, Option<GroupId>)>> {
            Ok(self.credentials.get(credential_name).copied())
        }

        async fn credential_group_rate_limit(&self, group_id: GroupId) -> Result<i32> {
            Ok(self.credential_groups.get(&group_id).copied().unwrap_or(0))
        }
    }

    fn mappings_with_limit(limit: i32) -> ModelMappings {
        let mappings = ModelMappings::new();
        mappings.store(
            Utc::now(),
            &[ModelMappingRow {
                id: 9,
                provider: "openai".into(),
                model_name: "gpt-4o".into(),
                alias: "fast".into(),
                strategy: RouteStrategy::RoundRobin,
                rate_limit: limit,
                enabled: true,
            }],
        );
        mappings
    }

    #[tokio::test]
    async fn bill_sum_wins_over_everything() {
        let store = FakeLimitStore {
            bill_sum: 7,
            users: HashMap::from([(1, (3, None))]),
            ..FakeLimitStore::default()
        };
        let decision = resolve_limit(&store, &mappings_with_limit(5), 2, 1, "openai", "fast", "cred", Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.limit, 7);
        assert_eq!(decision.scope, LimitScope::User);
        assert_eq!(decision.mapping_id, None);
    }

    #[tokio::test]
    async fn mapping_limit_scopes_to_mapping() {
        let store = FakeLimitStore::default();
        let decision = resolve_limit(&store, &mappings_with_limit(5), 2, 1, "openai", "fast", "cred", Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.limit, 5);
        assert_eq!(decision.scope, LimitScope::Mapping);
        assert_eq!(decision.mapping_id, Some(9));
    }

    #[tokio::test]
    async fn zero_levels_are_skipped_not_unlimited() {
        // User exists with limit 0 and a group that also has 0; the
        // credential's group finally supplies the limit.
        let store = FakeLimitStore {
            users: HashMap::from([(1, (0, Some(4)))]),
            user_groups: HashMap::from([(4, 0)]),
            credentials: HashMap::from([("cred".to_string(), (0, Some(8)))]),
            credential_groups: HashMap::from([(8, 6)]),
            ..FakeLimitStore::default()
        };
        let decision = resolve_limit(&store, &mappings_with_limit(0), 2, 1, "openai", "fast", "cred", Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.limit, 6);
        assert_eq!(decision.scope, LimitScope::User);
    }

    #[tokio::test]
    async fn settings_default_is_the_last_resort() {
        let store = FakeLimitStore::default();
        let mappings = ModelMappings::new();
        let decision = resolve_limit(&store, &mappings, 3, 1, "openai", "fast", "", Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.limit, 3);
    }

    #[tokio::test]
    async fn fully_unset_chain_yields_none() {
        let store = FakeLimitStore::default();
        let mappings = ModelMappings::new();
        let decision = resolve_limit(&store, &mappings, 0, 1, "openai", "fast", "", Utc::now())
            .await
            .unwrap();
        assert!(decision.is_none());
    }
}
