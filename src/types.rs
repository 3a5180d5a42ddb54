//! Common type definitions shared across the crate.
//!
//! Entity ids are `i64` aliases matching the upstream bigint schema:
//!
//! - [`UserId`]: user account identifier
//! - [`ApiKeyId`]: API key identifier
//! - [`MappingId`]: model mapping identifier
//! - [`GroupId`]: user-group / credential-group identifier
//! - [`CredentialRowId`]: backing-store id of a credential record

use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type ApiKeyId = i64;
pub type MappingId = i64;
pub type GroupId = i64;
pub type CredentialRowId = i64;

/// Per-request caller metadata extracted by the HTTP layer.
///
/// The core never parses headers or paths itself; the dispatch layer decides
/// whether the route is rate-limitable (model-listing calls are not) and
/// which identities are attached.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Authenticated user, when known.
    pub user_id: Option<UserId>,
    /// API key the request was made with, when known.
    pub api_key_id: Option<ApiKeyId>,
    /// Whether the rate limiter applies to this route.
    pub rate_limited: bool,
}

impl RequestMeta {
    /// Metadata for an authenticated, rate-limitable call.
    pub fn rate_limited(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            api_key_id: None,
            rate_limited: true,
        }
    }
}
