//! Repository implementations for database access.
//!
//! Each repository wraps a SQLx connection or transaction, provides
//! strongly-typed operations for one table, and returns domain models from
//! [`crate::db::models`]. Repositories that participate in settlement
//! (bills, prepaid cards, usage records) are designed to run inside the
//! caller's transaction so row locks span the whole debit.
//!
//! ```ignore
//! use tollgate::db::handlers::Bills;
//!
//! async fn example(pool: &sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!     let bills = Bills::new(&mut tx).lock_active_for_user(42, chrono::Utc::now()).await?;
//!     // ... debit ...
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

pub mod billing_rules;
pub mod bills;
pub mod bindings;
pub mod prepaid_cards;
pub mod rate_limits;
pub mod usage_records;

pub use billing_rules::BillingRules;
pub use bills::Bills;
pub use bindings::StickyBindings;
pub use prepaid_cards::PrepaidCards;
pub use rate_limits::RateLimits;
pub use usage_records::UsageRecords;
