//! Database models for billing rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::GroupId;

/// Pricing scheme of a billing rule, stored as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum BillingType {
    /// Flat price per call, in currency units.
    PerRequest = 1,
    /// Per-token prices, already scaled so `tokens * price` yields micros.
    PerToken = 2,
}

/// Pricing for a (credential-group, user-group, provider, model) cell.
///
/// `provider = '' AND model = ''` is the wildcard fallback within a group
/// pair. Provider matching is case-insensitive.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingRule {
    pub id: i64,
    pub auth_group_id: GroupId,
    pub user_group_id: GroupId,
    pub provider: String,
    pub model: String,
    pub billing_type: BillingType,
    pub price_per_request: Option<f64>,
    pub price_input_token: Option<f64>,
    pub price_output_token: Option<f64>,
    pub price_cache_read_token: Option<f64>,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BillingRule {
    /// Whether this rule names a concrete provider + model rather than the
    /// wildcard cell.
    pub fn is_exact_model(&self) -> bool {
        !self.provider.is_empty() && !self.model.is_empty()
    }
}
