//! Database models for sticky user-to-credential bindings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{MappingId, UserId};

/// Persisted (user, mapping) → credential assignment.
///
/// A binding may go stale when its credential leaves the pool; it is then
/// overwritten by the next sticky pick, never deleted out-of-band.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StickyBinding {
    pub user_id: UserId,
    pub mapping_id: MappingId,
    pub credential_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
