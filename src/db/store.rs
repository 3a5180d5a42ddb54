//! Pool-backed store implementations for the selection-path traits.
//!
//! The repositories in [`crate::db::handlers`] work on a borrowed connection
//! so settlement can hold a transaction across several of them. Selection
//! reads have no such need; [`PgStore`] acquires a connection from the pool
//! per call and delegates.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    db::{
        errors::Result,
        handlers::{Bills, RateLimits, StickyBindings, UsageRecords},
    },
    ratelimit::LimitStore,
    selector::SelectorStore,
    types::{CredentialRowId, GroupId, MappingId, UserId},
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LimitStore for PgStore {
    async fn bill_rate_limit_sum(&self, user_id: UserId, now: DateTime<Utc>) -> Result<i32> {
        let mut conn = self.pool.acquire().await?;
        Bills::new(&mut conn).rate_limit_sum(user_id, now).await
    }

    async fn user_rate_limit(&self, user_id: UserId) -> Result<Option<(i32, Option<GroupId>)>> {
        let mut conn = self.pool.acquire().await?;
        RateLimits::new(&mut conn).user_rate_limit(user_id).await
    }

    async fn user_group_rate_limit(&self, group_id: GroupId) -> Result<i32> {
        let mut conn = self.pool.acquire().await?;
        RateLimits::new(&mut conn).user_group_rate_limit(group_id).await
    }

    async fn credential_rate_limit(&self, credential_name: &str) -> Result<Option<(i32, Option<GroupId>)>> {
        let mut conn = self.pool.acquire().await?;
        RateLimits::new(&mut conn).credential_rate_limit(credential_name).await
    }

    async fn credential_group_rate_limit(&self, group_id: GroupId) -> Result<i32> {
        let mut conn = self.pool.acquire().await?;
        RateLimits::new(&mut conn).credential_group_rate_limit(group_id).await
    }
}

#[async_trait]
impl SelectorStore for PgStore {
    async fn credential_row_ids(&self, names: &[String]) -> Result<HashMap<String, CredentialRowId>> {
        let mut conn = self.pool.acquire().await?;
        RateLimits::new(&mut conn).credential_row_ids(names).await
    }

    async fn sticky_binding(&self, user_id: UserId, mapping_id: MappingId) -> Result<Option<String>> {
        let mut conn = self.pool.acquire().await?;
        StickyBindings::new(&mut conn).get(user_id, mapping_id).await
    }

    async fn bind_sticky(&self, user_id: UserId, mapping_id: MappingId, credential_name: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        StickyBindings::new(&mut conn)
            .upsert(user_id, mapping_id, credential_name, Utc::now())
            .await
    }

    async fn usage_counts(
        &self,
        user_id: UserId,
        provider: &str,
        model: &str,
        names: &[String],
    ) -> Result<HashMap<String, i64>> {
        let mut conn = self.pool.acquire().await?;
        UsageRecords::new(&mut conn)
            .counts_by_credential(user_id, provider, model, names)
            .await
    }
}
