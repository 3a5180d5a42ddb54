//! Database layer: domain models, per-table repositories, and the pooled
//! store used by the selection path.
//!
//! Settlement drives the repositories directly so a single transaction can
//! lock bills and prepaid cards together; everything else goes through
//! [`PgStore`].

pub mod errors;
pub mod handlers;
pub mod models;
pub mod store;

pub use store::PgStore;
