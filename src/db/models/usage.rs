//! Database models for the append-only usage log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ApiKeyId, CredentialRowId, UserId};

/// Token counts reported for one completed call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub reasoning_tokens: i64,
    /// Tokens served from the provider-side prompt cache.
    pub cached_tokens: i64,
    /// Reported total; when zero it is derived from the other counts.
    pub total_tokens: i64,
}

impl TokenUsage {
    /// Reported total, falling back to the sum of the component counts.
    pub fn effective_total(&self) -> i64 {
        if self.total_tokens != 0 {
            self.total_tokens
        } else {
            self.input_tokens + self.output_tokens + self.reasoning_tokens
        }
    }
}

/// One row of the usage log. Rows are never updated after insert.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageRecord {
    pub id: i64,
    pub provider: String,
    /// Client-visible model name (alias-resolved when a mapping exists).
    pub model: String,
    pub user_id: Option<UserId>,
    pub api_key_id: Option<ApiKeyId>,
    pub credential_id: Option<CredentialRowId>,
    pub credential_name: String,
    pub requested_at: DateTime<Utc>,
    pub failed: bool,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub reasoning_tokens: i64,
    pub cached_tokens: i64,
    pub total_tokens: i64,
    /// Cost in micro-currency units; zero for failed calls.
    pub cost_micros: i64,
    pub created_at: DateTime<Utc>,
}

/// Insert request for a usage row.
#[derive(Debug, Clone)]
pub struct UsageRecordCreateDBRequest {
    pub provider: String,
    pub model: String,
    pub user_id: Option<UserId>,
    pub api_key_id: Option<ApiKeyId>,
    pub credential_id: Option<CredentialRowId>,
    pub credential_name: String,
    pub requested_at: DateTime<Utc>,
    pub failed: bool,
    pub tokens: TokenUsage,
    pub cost_micros: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_total_prefers_reported_value() {
        let tokens = TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            reasoning_tokens: 2,
            cached_tokens: 0,
            total_tokens: 20,
        };
        assert_eq!(tokens.effective_total(), 20);
    }

    #[test]
    fn effective_total_derives_when_unreported() {
        let tokens = TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            reasoning_tokens: 2,
            ..TokenUsage::default()
        };
        assert_eq!(tokens.effective_total(), 17);
    }
}
