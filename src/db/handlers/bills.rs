//! Database repository for subscription bills.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

use crate::{
    db::{
        errors::Result,
        models::bills::{Bill, BillStatus},
    },
    types::UserId,
};

pub struct Bills<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Bills<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Load the user's debitable bills, locked for update.
    ///
    /// Debitable means enabled, paid, with positive remaining quota, and with
    /// a validity window covering `now`. Rows come back soonest-expiring
    /// first so the greedy debit drains the bill that dies first. Must run
    /// inside a transaction: the `FOR UPDATE` locks serialize concurrent
    /// settlements for the same user.
    #[instrument(skip(self), err)]
    pub async fn lock_active_for_user(&mut self, user_id: UserId, now: DateTime<Utc>) -> Result<Vec<Bill>> {
        let bills = sqlx::query_as::<_, Bill>(
            r#"
            SELECT id, plan_id, user_id, period_start, period_end,
                   total_quota, daily_quota, used_quota, left_quota,
                   rate_limit, used_count, is_enabled, status, created_at, updated_at
            FROM bills
            WHERE user_id = $1
              AND is_enabled = TRUE
              AND status = $2
              AND left_quota > 0
              AND period_start <= $3
              AND period_end >= $3
            ORDER BY period_end ASC, period_start ASC, id ASC
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(BillStatus::Paid)
        .bind(now)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(bills)
    }

    /// Debit one bill. Callers must hold the row lock from
    /// [`lock_active_for_user`](Self::lock_active_for_user) and never debit
    /// more than the bill's remaining quota.
    pub async fn apply_debit(&mut self, bill_id: i64, amount: f64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE bills
            SET used_quota = used_quota + $2,
                left_quota = left_quota - $2,
                used_count = used_count + 1,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(bill_id)
        .bind(amount)
        .bind(now)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Sum of rate limits across the user's currently active paid bills.
    /// Feeds the top of the rate-limit resolution chain.
    #[instrument(skip(self), err)]
    pub async fn rate_limit_sum(&mut self, user_id: UserId, now: DateTime<Utc>) -> Result<i32> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(rate_limit), 0)
            FROM bills
            WHERE user_id = $1
              AND is_enabled = TRUE
              AND status = $2
              AND left_quota > 0
              AND rate_limit > 0
              AND period_start <= $3
              AND period_end >= $3
            "#,
        )
        .bind(user_id)
        .bind(BillStatus::Paid)
        .bind(now)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(i32::try_from(total).unwrap_or(i32::MAX))
    }
}
