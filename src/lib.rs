//! Admission and metering core for a multi-tenant API proxy.
//!
//! Three cooperating pieces sit between the HTTP layer and the upstream
//! providers:
//!
//! - [`Selector`] picks one upstream credential per request, honoring
//!   per-model cooldowns and the mapping's routing strategy (round-robin,
//!   fill-first, or sticky per-user bindings), then gates the caller on the
//!   resolved rate limit.
//! - [`ratelimit::Manager`] enforces fixed one-second windows, preferring a
//!   shared Redis counter space and falling back to an in-process table
//!   behind a circuit breaker. Limiting always fails open.
//! - [`UsageSettlement`] runs after the upstream call finished: it appends
//!   the usage record, prices the call from the billing rules, and debits
//!   subscription bills (then prepaid cards) inside one locked transaction.
//!
//! The crate owns no HTTP routes and no credential refresh loop; hosts feed
//! it [`RequestMeta`], candidate [`Credential`]s, and finished
//! [`CallRecord`]s, and render [`Error`] into responses via its
//! `IntoResponse` impl.

pub mod config;
pub mod credential;
pub mod db;
pub mod errors;
pub mod mapping;
pub mod ratelimit;
pub mod selector;
pub mod settlement;
pub mod telemetry;
pub mod types;

pub use config::{Config, LimiterSettings, SettingsProvider, fixed_settings};
pub use credential::{CooldownState, Credential};
pub use db::PgStore;
pub use errors::{Error, Result};
pub use mapping::{ModelMappingRow, ModelMappings, RouteStrategy};
pub use ratelimit::{Manager, RateLimitResult};
pub use selector::{Selector, SelectorStore};
pub use settlement::{CallRecord, UsageSettlement};
pub use types::RequestMeta;
