//! Database lookups feeding rate-limit resolution and credential routing.
//!
//! Credentials live in the `credentials` table, maintained by the config
//! watcher; this repository only reads the columns the core needs: row ids
//! (fill-first ordering), per-credential rate limits, and group membership.

use std::collections::HashMap;

use sqlx::PgConnection;
use tracing::instrument;

use crate::{
    db::errors::Result,
    types::{CredentialRowId, GroupId, UserId},
};

pub struct RateLimits<'c> {
    db: &'c mut PgConnection,
}

impl<'c> RateLimits<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// A user's individual rate limit and group membership. `None` when the
    /// user row is missing (treated as "unset" by the resolution chain).
    pub async fn user_rate_limit(&mut self, user_id: UserId) -> Result<Option<(i32, Option<GroupId>)>> {
        let row: Option<(i32, Option<GroupId>)> =
            sqlx::query_as("SELECT rate_limit, user_group_id FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&mut *self.db)
                .await?;
        Ok(row)
    }

    /// A user group's default rate limit; zero when the group is missing.
    pub async fn user_group_rate_limit(&mut self, group_id: GroupId) -> Result<i32> {
        let limit: Option<i32> = sqlx::query_scalar("SELECT rate_limit FROM user_groups WHERE id = $1")
            .bind(group_id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(limit.unwrap_or(0))
    }

    /// A credential's individual rate limit and group membership, by name.
    pub async fn credential_rate_limit(&mut self, credential_name: &str) -> Result<Option<(i32, Option<GroupId>)>> {
        let row: Option<(i32, Option<GroupId>)> =
            sqlx::query_as("SELECT rate_limit, auth_group_id FROM credentials WHERE name = $1")
                .bind(credential_name)
                .fetch_optional(&mut *self.db)
                .await?;
        Ok(row)
    }

    /// A credential group's default rate limit; zero when the group is missing.
    pub async fn credential_group_rate_limit(&mut self, group_id: GroupId) -> Result<i32> {
        let limit: Option<i32> = sqlx::query_scalar("SELECT rate_limit FROM auth_groups WHERE id = $1")
            .bind(group_id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(limit.unwrap_or(0))
    }

    /// Backing-store row ids for a set of credential names. Names without a
    /// row are absent from the map; fill-first treats them as lowest
    /// priority.
    #[instrument(skip(self, names), err)]
    pub async fn credential_row_ids(&mut self, names: &[String]) -> Result<HashMap<String, CredentialRowId>> {
        let rows: Vec<(String, CredentialRowId)> =
            sqlx::query_as("SELECT name, id FROM credentials WHERE name = ANY($1)")
                .bind(names)
                .fetch_all(&mut *self.db)
                .await?;
        Ok(rows.into_iter().collect())
    }

    /// Row id for one credential name, if present.
    pub async fn credential_id_by_name(&mut self, name: &str) -> Result<Option<CredentialRowId>> {
        let id: Option<CredentialRowId> = sqlx::query_scalar("SELECT id FROM credentials WHERE name = $1")
            .bind(name)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(id)
    }

    /// Credential-group membership by row id, for billing-rule selection.
    pub async fn credential_group_by_id(&mut self, credential_id: CredentialRowId) -> Result<Option<GroupId>> {
        let group: Option<Option<GroupId>> =
            sqlx::query_scalar("SELECT auth_group_id FROM credentials WHERE id = $1")
                .bind(credential_id)
                .fetch_optional(&mut *self.db)
                .await?;
        Ok(group.flatten())
    }

    /// User-group membership for a user, for billing-rule selection.
    pub async fn user_group_by_user(&mut self, user_id: UserId) -> Result<Option<GroupId>> {
        let group: Option<Option<GroupId>> =
            sqlx::query_scalar("SELECT user_group_id FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&mut *self.db)
                .await?;
        Ok(group.flatten())
    }

    /// User-group membership resolved through an API key's owning user.
    pub async fn user_group_by_api_key(&mut self, api_key_id: i64) -> Result<Option<GroupId>> {
        let group: Option<Option<GroupId>> = sqlx::query_scalar(
            r#"
            SELECT u.user_group_id
            FROM api_keys k
            JOIN users u ON u.id = k.user_id
            WHERE k.id = $1
            "#,
        )
        .bind(api_key_id)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(group.flatten())
    }
}
