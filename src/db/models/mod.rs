//! Database record structures matching table schemas.

pub mod billing_rules;
pub mod bills;
pub mod bindings;
pub mod prepaid_cards;
pub mod usage;

pub use billing_rules::{BillingRule, BillingType};
pub use bills::{Bill, BillStatus};
pub use bindings::StickyBinding;
pub use prepaid_cards::PrepaidCard;
pub use usage::{TokenUsage, UsageRecord, UsageRecordCreateDBRequest};
