//! Database repository for billing rules and default group lookup.

use sqlx::PgConnection;
use tracing::instrument;

use crate::{
    db::{errors::Result, models::billing_rules::BillingRule},
    types::GroupId,
};

const RULE_COLUMNS: &str = "id, auth_group_id, user_group_id, provider, model, billing_type, \
     price_per_request, price_input_token, price_output_token, price_cache_read_token, \
     is_enabled, created_at, updated_at";

pub struct BillingRules<'c> {
    db: &'c mut PgConnection,
}

impl<'c> BillingRules<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Load enabled rule candidates for a group pair, including the wildcard
    /// (`provider = '' AND model = ''`) cell. When `fallback` names a
    /// different pair it is fetched in the same query, avoiding a redundant
    /// second round trip when the pairs coincide.
    #[instrument(skip(self), err)]
    pub async fn candidates(
        &mut self,
        primary: (GroupId, GroupId),
        fallback: Option<(GroupId, GroupId)>,
        provider: &str,
        model: &str,
    ) -> Result<Vec<BillingRule>> {
        let provider_lower = provider.to_lowercase();
        let rules = match fallback.filter(|pair| *pair != primary) {
            Some((fallback_auth, fallback_user)) => {
                sqlx::query_as::<_, BillingRule>(&format!(
                    r#"
                    SELECT {RULE_COLUMNS}
                    FROM billing_rules
                    WHERE is_enabled = TRUE
                      AND ((auth_group_id = $1 AND user_group_id = $2)
                        OR (auth_group_id = $3 AND user_group_id = $4))
                      AND ((LOWER(provider) = $5 AND model = $6)
                        OR (provider = '' AND model = ''))
                    "#
                ))
                .bind(primary.0)
                .bind(primary.1)
                .bind(fallback_auth)
                .bind(fallback_user)
                .bind(&provider_lower)
                .bind(model)
                .fetch_all(&mut *self.db)
                .await?
            }
            None => {
                sqlx::query_as::<_, BillingRule>(&format!(
                    r#"
                    SELECT {RULE_COLUMNS}
                    FROM billing_rules
                    WHERE is_enabled = TRUE
                      AND auth_group_id = $1 AND user_group_id = $2
                      AND ((LOWER(provider) = $3 AND model = $4)
                        OR (provider = '' AND model = ''))
                    "#
                ))
                .bind(primary.0)
                .bind(primary.1)
                .bind(&provider_lower)
                .bind(model)
                .fetch_all(&mut *self.db)
                .await?
            }
        };

        Ok(rules)
    }

    /// Default credential group, used when a credential carries no group.
    pub async fn default_auth_group_id(&mut self) -> Result<Option<GroupId>> {
        let id: Option<GroupId> =
            sqlx::query_scalar("SELECT id FROM auth_groups WHERE is_default = TRUE ORDER BY id ASC LIMIT 1")
                .fetch_optional(&mut *self.db)
                .await?;
        Ok(id)
    }

    /// Default user group, used when a user carries no group.
    pub async fn default_user_group_id(&mut self) -> Result<Option<GroupId>> {
        let id: Option<GroupId> =
            sqlx::query_scalar("SELECT id FROM user_groups WHERE is_default = TRUE ORDER BY id ASC LIMIT 1")
                .fetch_optional(&mut *self.db)
                .await?;
        Ok(id)
    }
}
