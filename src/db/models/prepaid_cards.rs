//! Database models for prepaid balance cards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::UserId;

/// A prepaid balance redeemed by a user.
///
/// Cards are debited only after every eligible bill is exhausted, in
/// `expires_at ASC NULLS LAST, redeemed_at ASC NULLS LAST, id ASC` order so
/// the earliest-expiring balance is spent first.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PrepaidCard {
    pub id: i64,
    /// User who redeemed the card; cards are only debitable once redeemed.
    pub redeemed_user_id: Option<UserId>,
    /// Remaining balance in currency units.
    pub balance: f64,
    pub is_enabled: bool,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
