//! Database repository for prepaid balance cards.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

use crate::{
    db::{errors::Result, models::prepaid_cards::PrepaidCard},
    types::UserId,
};

pub struct PrepaidCards<'c> {
    db: &'c mut PgConnection,
}

impl<'c> PrepaidCards<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Load the user's debitable cards, locked for update, earliest-expiring
    /// first. Only enabled, redeemed, unexpired cards with a positive
    /// balance qualify. Must run inside a transaction.
    #[instrument(skip(self), err)]
    pub async fn lock_debitable_for_user(&mut self, user_id: UserId, now: DateTime<Utc>) -> Result<Vec<PrepaidCard>> {
        let cards = sqlx::query_as::<_, PrepaidCard>(
            r#"
            SELECT id, redeemed_user_id, balance, is_enabled,
                   redeemed_at, expires_at, created_at, updated_at
            FROM prepaid_cards
            WHERE redeemed_user_id = $1
              AND is_enabled = TRUE
              AND balance > 0
              AND redeemed_at IS NOT NULL
              AND (expires_at IS NULL OR expires_at >= $2)
            ORDER BY expires_at ASC NULLS LAST, redeemed_at ASC NULLS LAST, id ASC
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(cards)
    }

    /// Debit one card. Callers must hold the row lock from
    /// [`lock_debitable_for_user`](Self::lock_debitable_for_user).
    pub async fn apply_debit(&mut self, card_id: i64, amount: f64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE prepaid_cards
            SET balance = balance - $2,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(card_id)
        .bind(amount)
        .bind(now)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }
}
