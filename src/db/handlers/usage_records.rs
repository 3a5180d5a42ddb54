//! Database repository for the append-only usage log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

use crate::{
    db::{
        errors::Result,
        models::usage::{UsageRecord, UsageRecordCreateDBRequest},
    },
    types::UserId,
};

pub struct UsageRecords<'c> {
    db: &'c mut PgConnection,
}

impl<'c> UsageRecords<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Append one usage row. Rows are immutable after insert.
    #[instrument(skip(self, request), fields(provider = %request.provider, model = %request.model), err)]
    pub async fn create(&mut self, request: &UsageRecordCreateDBRequest) -> Result<UsageRecord> {
        let record = sqlx::query_as::<_, UsageRecord>(
            r#"
            INSERT INTO usage_records (
                provider, model, user_id, api_key_id, credential_id, credential_name,
                requested_at, failed, input_tokens, output_tokens, reasoning_tokens,
                cached_tokens, total_tokens, cost_micros
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING id, provider, model, user_id, api_key_id, credential_id, credential_name,
                      requested_at, failed, input_tokens, output_tokens, reasoning_tokens,
                      cached_tokens, total_tokens, cost_micros, created_at
            "#,
        )
        .bind(&request.provider)
        .bind(&request.model)
        .bind(request.user_id)
        .bind(request.api_key_id)
        .bind(request.credential_id)
        .bind(&request.credential_name)
        .bind(request.requested_at)
        .bind(request.failed)
        .bind(request.tokens.input_tokens)
        .bind(request.tokens.output_tokens)
        .bind(request.tokens.reasoning_tokens)
        .bind(request.tokens.cached_tokens)
        .bind(request.tokens.effective_total())
        .bind(request.cost_micros)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(record)
    }

    /// Sum of the user's usage cost since `day_start`, in micros. Used for
    /// the daily-cap check during bill debits.
    pub async fn cost_micros_since(&mut self, user_id: UserId, day_start: DateTime<Utc>) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(cost_micros), 0)
            FROM usage_records
            WHERE user_id = $1 AND requested_at >= $2
            "#,
        )
        .bind(user_id)
        .bind(day_start)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(total)
    }

    /// Historical call counts per credential for one user + provider + model.
    /// Feeds the sticky strategy's least-used pick; credentials with no rows
    /// are simply absent from the map.
    #[instrument(skip(self, credential_names), err)]
    pub async fn counts_by_credential(
        &mut self,
        user_id: UserId,
        provider: &str,
        model: &str,
        credential_names: &[String],
    ) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT credential_name, COUNT(*) AS calls
            FROM usage_records
            WHERE user_id = $1 AND provider = $2 AND model = $3
              AND credential_name = ANY($4)
            GROUP BY credential_name
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .bind(model)
        .bind(credential_names)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(rows.into_iter().collect())
    }
}
