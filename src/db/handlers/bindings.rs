//! Database repository for sticky user-to-credential bindings.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

use crate::{
    db::errors::Result,
    types::{MappingId, UserId},
};

pub struct StickyBindings<'c> {
    db: &'c mut PgConnection,
}

impl<'c> StickyBindings<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Bound credential name for a (user, mapping) pair, if any.
    pub async fn get(&mut self, user_id: UserId, mapping_id: MappingId) -> Result<Option<String>> {
        let name: Option<String> = sqlx::query_scalar(
            r#"
            SELECT credential_name
            FROM sticky_bindings
            WHERE user_id = $1 AND mapping_id = $2
            "#,
        )
        .bind(user_id)
        .bind(mapping_id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(name)
    }

    /// Insert-or-update on the unique (user, mapping) key. Concurrent
    /// first-time binds race harmlessly: last writer wins, and both writers
    /// computed a valid candidate.
    #[instrument(skip(self), err)]
    pub async fn upsert(
        &mut self,
        user_id: UserId,
        mapping_id: MappingId,
        credential_name: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sticky_bindings (user_id, mapping_id, credential_name, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (user_id, mapping_id)
            DO UPDATE SET credential_name = EXCLUDED.credential_name,
                          updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(user_id)
        .bind(mapping_id)
        .bind(credential_name)
        .bind(now)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }
}
