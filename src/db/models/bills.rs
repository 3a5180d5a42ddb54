//! Database models for subscription bills.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::UserId;

/// Lifecycle state of a bill, stored as an integer in the database.
///
/// Transitions are administrative only: `Pending → Paid` and
/// `Paid → RefundRequested → Refunded`. Settlement reads `Paid` bills and
/// never changes status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    Pending = 1,
    Paid = 2,
    RefundRequested = 3,
    Refunded = 4,
}

/// A paid subscription period with quota bookkeeping.
///
/// Invariant maintained by the debit path: `used_quota + left_quota` is
/// conserved across debits.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Bill {
    pub id: i64,
    pub plan_id: i64,
    pub user_id: UserId,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    /// Total quota for the period, in currency units.
    pub total_quota: f64,
    /// Daily cap in currency units; zero or negative means unlimited.
    pub daily_quota: f64,
    pub used_quota: f64,
    pub left_quota: f64,
    /// Calls per second granted by this bill; zero means none.
    pub rate_limit: i32,
    pub used_count: i32,
    pub is_enabled: bool,
    pub status: BillStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
