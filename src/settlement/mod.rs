//! Usage settlement: record the call, price it, and debit quota.
//!
//! Settlement runs after the proxied call finished, detached from the
//! response path. [`UsageSettlement::handle_usage`] therefore never returns
//! an error: anything that goes wrong is logged and the caller's response is
//! unaffected. The debit itself runs in one transaction with `FOR UPDATE`
//! row locks, so concurrent settlements for the same user serialize and
//! quota is conserved.

pub mod cost;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, instrument, warn};

use crate::{
    db::{
        handlers::{BillingRules, Bills, PrepaidCards, RateLimits, UsageRecords},
        models::bills::Bill,
        models::usage::{TokenUsage, UsageRecordCreateDBRequest},
    },
    errors::Result,
    mapping::ModelMappings,
    types::{RequestMeta, UserId},
};

use cost::{cost_micros, select_billing_rule};

/// Tolerance when comparing accumulated f64 quota amounts.
const QUOTA_EPSILON: f64 = 1e-6;

/// Micro-units per quota unit.
const MICROS: f64 = 1_000_000.0;

/// Upper bound for one settlement run; past it the attempt is abandoned.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the proxy knows about one finished upstream call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub provider: String,
    /// Upstream model name as sent to the provider.
    pub model: String,
    pub credential_name: String,
    pub requested_at: DateTime<Utc>,
    /// Failed calls are logged but never billed.
    pub failed: bool,
    pub tokens: TokenUsage,
    pub meta: RequestMeta,
}

/// Prices finished calls and debits the payer's quota.
pub struct UsageSettlement {
    pool: PgPool,
    mappings: Arc<ModelMappings>,
}

impl UsageSettlement {
    pub fn new(pool: PgPool, mappings: Arc<ModelMappings>) -> Self {
        Self { pool, mappings }
    }

    /// Settles one call. Infallible by contract: errors and timeouts are
    /// logged and swallowed so the response path never blocks on billing.
    #[instrument(skip(self, record), fields(provider = %record.provider, model = %record.model))]
    pub async fn handle_usage(&self, record: CallRecord) {
        match tokio::time::timeout(SETTLE_TIMEOUT, self.settle(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(error = %err, credential = %record.credential_name, "settlement failed");
            }
            Err(_) => {
                warn!(credential = %record.credential_name, "settlement timed out");
            }
        }
    }

    async fn settle(&self, record: &CallRecord) -> Result<()> {
        // Reference data reads run outside the debit transaction to keep the
        // row locks short. They also degrade rather than fail: the usage row
        // must be written even when the lookups misbehave, so errors here
        // fall back to "no credential id" and "free call".
        let mut conn = self.pool.acquire().await.map_err(crate::db::errors::DbError::from)?;
        let credential_id = fallback_on_error(
            RateLimits::new(&mut conn)
                .credential_id_by_name(&record.credential_name)
                .await,
            None,
            "credential lookup",
        );

        // The usage log stores the client-visible name when a mapping exists.
        let logged_model = self
            .mappings
            .mapped_alias(&record.provider, &record.model)
            .unwrap_or_else(|| record.model.clone());

        let cost = if record.failed {
            0
        } else {
            fallback_on_error(self.price_call(&mut conn, record, credential_id).await, 0, "costing")
        };
        drop(conn);

        let mut tx = self.pool.begin().await.map_err(crate::db::errors::DbError::from)?;
        UsageRecords::new(&mut tx)
            .create(&UsageRecordCreateDBRequest {
                provider: record.provider.clone(),
                model: logged_model,
                user_id: record.meta.user_id,
                api_key_id: record.meta.api_key_id,
                credential_id,
                credential_name: record.credential_name.clone(),
                requested_at: record.requested_at,
                failed: record.failed,
                tokens: record.tokens,
                cost_micros: cost,
            })
            .await?;

        if cost > 0
            && let Some(user_id) = record.meta.user_id.filter(|id| *id > 0)
        {
            self.debit(&mut tx, user_id, cost).await?;
        }

        tx.commit().await.map_err(crate::db::errors::DbError::from)?;
        Ok(())
    }

    /// Resolves the billing rule for the call and prices it, in micros.
    /// Missing groups or rules mean the call is free.
    async fn price_call(
        &self,
        conn: &mut PgConnection,
        record: &CallRecord,
        credential_id: Option<i64>,
    ) -> Result<i64> {
        let mut rate_limits = RateLimits::new(conn);
        let mut auth_group = match credential_id {
            Some(id) => rate_limits.credential_group_by_id(id).await?,
            None => None,
        };
        let mut user_group = match record.meta.api_key_id {
            Some(key_id) => rate_limits.user_group_by_api_key(key_id).await?,
            None => None,
        };
        if user_group.is_none()
            && let Some(user_id) = record.meta.user_id
        {
            user_group = rate_limits.user_group_by_user(user_id).await?;
        }
        drop(rate_limits);

        let mut rules_repo = BillingRules::new(conn);
        let default_auth = rules_repo.default_auth_group_id().await?;
        let default_user = rules_repo.default_user_group_id().await?;
        if auth_group.is_none() {
            auth_group = default_auth;
        }
        if user_group.is_none() {
            user_group = default_user;
        }
        let (Some(auth_group), Some(user_group)) = (auth_group, user_group) else {
            debug!(credential = %record.credential_name, "no billing groups resolved, call is free");
            return Ok(0);
        };

        let primary = (auth_group, user_group);
        let fallback = match (default_auth, default_user) {
            (Some(a), Some(u)) => Some((a, u)),
            _ => None,
        };
        let candidates = rules_repo
            .candidates(primary, fallback, &record.provider, &record.model)
            .await?;
        let Some(rule) = select_billing_rule(&candidates, primary) else {
            return Ok(0);
        };
        Ok(cost_micros(rule, &record.tokens))
    }

    /// Debits `cost` micros from the user's bills, falling back to prepaid
    /// cards when the bills cannot cover it. Runs inside the caller's
    /// transaction.
    async fn debit(&self, tx: &mut sqlx::PgTransaction<'_>, user_id: UserId, cost: i64) -> Result<()> {
        let now = Utc::now();
        let amount = cost as f64 / MICROS;

        let bills = Bills::new(tx).lock_active_for_user(user_id, now).await?;
        let mut used_today = 0;
        if daily_cap_applies(&bills) {
            used_today = UsageRecords::new(tx)
                .cost_micros_since(user_id, local_day_start(now))
                .await?;
        }

        if bills_can_cover(&bills, used_today, cost) {
            let entries: Vec<(i64, f64)> = bills.iter().map(|b| (b.id, b.left_quota)).collect();
            let (debits, leftover) = plan_spread(&entries, amount);
            for (bill_id, debit) in debits {
                Bills::new(tx).apply_debit(bill_id, debit, now).await?;
            }
            if leftover > QUOTA_EPSILON {
                return Err(crate::errors::Error::Other(anyhow::anyhow!(
                    "bill debit left {leftover} unspread for user {user_id}"
                )));
            }
            return Ok(());
        }

        debug!(user_id, "bills cannot absorb the debit, falling back to prepaid");
        let cards = PrepaidCards::new(tx).lock_debitable_for_user(user_id, now).await?;
        let entries: Vec<(i64, f64)> = cards.iter().map(|c| (c.id, c.balance)).collect();
        let (debits, leftover) = plan_spread(&entries, amount);
        for (card_id, debit) in debits {
            PrepaidCards::new(tx).apply_debit(card_id, debit, now).await?;
        }
        if leftover > QUOTA_EPSILON {
            // Accepted under-funding: the call already happened, so the
            // uncovered remainder is written off rather than clawed back.
            warn!(user_id, uncovered = leftover, "prepaid balance insufficient for settlement");
        }
        Ok(())
    }
}

/// Reference-data reads degrade to a fallback so the call is still
/// recorded; only the insert and debit paths may fail settlement.
fn fallback_on_error<T, E: std::fmt::Display>(result: std::result::Result<T, E>, fallback: T, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "{} failed, settling with fallback", what);
            fallback
        }
    }
}

/// The daily cap only binds when every locked bill carries a finite cap; a
/// single uncapped bill lifts it for the whole pool.
fn daily_cap_applies(bills: &[Bill]) -> bool {
    !bills.is_empty() && bills.iter().all(|b| b.daily_quota > 0.0)
}

/// Whether the bill path absorbs this debit, or settlement must fall back
/// to prepaid cards. Bills either cover the full amount or none of it.
fn bills_can_cover(bills: &[Bill], used_today_micros: i64, cost_micros: i64) -> bool {
    if bills.is_empty() {
        return false;
    }
    let amount = cost_micros as f64 / MICROS;
    let total_left: f64 = bills.iter().map(|b| b.left_quota).sum();
    if total_left + QUOTA_EPSILON < amount {
        return false;
    }
    if !daily_cap_applies(bills) {
        return true;
    }
    let total_daily: f64 = bills.iter().map(|b| b.daily_quota).sum();
    !daily_cap_reached(total_daily, used_today_micros, cost_micros)
}

/// Midnight of the local calendar day containing `now`, in UTC.
fn local_day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let local_day = now.with_timezone(&Local).date_naive();
    match local_day.and_hms_opt(0, 0, 0).and_then(|dt| dt.and_local_timezone(Local).single()) {
        Some(start) => start.with_timezone(&Utc),
        // DST gap at midnight or similar oddity; fall back to the UTC day.
        None => now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(now),
    }
}

/// Whether today's prior spend already meets the summed daily cap. The
/// current call's usage row is inserted before the debit in the same
/// transaction, so its cost is subtracted to compare prior spend only.
fn daily_cap_reached(total_daily: f64, used_today_micros: i64, cost_micros: i64) -> bool {
    let prior_units = (used_today_micros - cost_micros).max(0) as f64 / MICROS;
    prior_units >= total_daily
}

/// Greedy spread of `amount` over `(id, balance)` entries in the given
/// order. Returns the per-entry debits and whatever could not be covered.
fn plan_spread(entries: &[(i64, f64)], amount: f64) -> (Vec<(i64, f64)>, f64) {
    let mut remaining = amount;
    let mut debits = Vec::new();
    for (id, balance) in entries {
        if remaining <= QUOTA_EPSILON {
            break;
        }
        let debit = balance.min(remaining);
        if debit <= 0.0 {
            continue;
        }
        debits.push((*id, debit));
        remaining -= debit;
    }
    (debits, remaining.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::bills::BillStatus;

    fn bill(id: i64, left_quota: f64, daily_quota: f64) -> Bill {
        let now = Utc::now();
        Bill {
            id,
            plan_id: 1,
            user_id: 7,
            period_start: now - chrono::Duration::days(1),
            period_end: now + chrono::Duration::days(29),
            total_quota: left_quota,
            daily_quota,
            used_quota: 0.0,
            left_quota,
            rate_limit: 0,
            used_count: 0,
            is_enabled: true,
            status: BillStatus::Paid,
            created_at: now,
            updated_at: now,
        }
    }

    const UNIT: i64 = 1_000_000;

    #[test]
    fn bills_cover_when_the_pool_total_suffices() {
        // 10.0 units across three 4.0 bills: covered in full, spread greedily.
        let bills = vec![bill(1, 4.0, 0.0), bill(2, 4.0, 0.0), bill(3, 4.0, 0.0)];
        assert!(bills_can_cover(&bills, 0, 10 * UNIT));

        let entries: Vec<(i64, f64)> = bills.iter().map(|b| (b.id, b.left_quota)).collect();
        let (debits, leftover) = plan_spread(&entries, 10.0);
        let spread: f64 = debits.iter().map(|(_, d)| d).sum();
        assert!((spread - 10.0).abs() < QUOTA_EPSILON);
        assert!(leftover < QUOTA_EPSILON);
    }

    #[test]
    fn insufficient_bills_take_none_of_the_debit() {
        let bills = vec![bill(1, 4.0, 0.0), bill(2, 4.0, 0.0), bill(3, 4.0, 0.0)];
        assert!(!bills_can_cover(&bills, 0, 13 * UNIT));
        assert!(!bills_can_cover(&[], 0, UNIT));
    }

    #[test]
    fn one_uncapped_bill_lifts_the_daily_cap() {
        // The capped bill's 1.0/day is long spent, but the uncapped bill
        // keeps the whole pool on the bill path.
        let mixed = vec![bill(1, 4.0, 1.0), bill(2, 4.0, 0.0)];
        assert!(!daily_cap_applies(&mixed));
        assert!(bills_can_cover(&mixed, 5 * UNIT, UNIT));
    }

    #[test]
    fn fully_capped_pool_rejects_past_the_daily_sum() {
        let capped = vec![bill(1, 4.0, 1.0), bill(2, 4.0, 1.0)];
        assert!(daily_cap_applies(&capped));
        // Prior spend today (3.0 minus this 1.0 call) exceeds the 2.0 cap.
        assert!(!bills_can_cover(&capped, 3 * UNIT, UNIT));
        // Under the cap the same pool still covers.
        assert!(bills_can_cover(&capped, UNIT, UNIT));
    }

    #[test]
    fn reference_read_errors_degrade_to_the_fallback() {
        let failed: crate::db::errors::Result<Option<i64>> =
            Err(crate::db::errors::DbError::Other(anyhow::anyhow!("connection reset")));
        assert_eq!(fallback_on_error(failed, None, "credential lookup"), None);
        assert_eq!(fallback_on_error(Ok::<i64, crate::db::errors::DbError>(42), 0, "costing"), 42);
    }

    #[test]
    fn spread_drains_entries_in_order() {
        let entries = vec![(1, 0.5), (2, 2.0), (3, 1.0)];
        let (debits, leftover) = plan_spread(&entries, 1.2);
        assert_eq!(debits.len(), 2);
        assert_eq!(debits[0].0, 1);
        assert!((debits[0].1 - 0.5).abs() < QUOTA_EPSILON);
        assert_eq!(debits[1].0, 2);
        assert!((debits[1].1 - 0.7).abs() < QUOTA_EPSILON);
        assert!(leftover < QUOTA_EPSILON);
    }

    #[test]
    fn spread_conserves_the_total() {
        let entries = vec![(1, 0.3), (2, 0.3), (3, 0.3)];
        let (debits, leftover) = plan_spread(&entries, 1.0);
        let spread: f64 = debits.iter().map(|(_, d)| d).sum();
        assert!((spread + leftover - 1.0).abs() < QUOTA_EPSILON);
        assert!((leftover - 0.1).abs() < QUOTA_EPSILON);
    }

    #[test]
    fn spread_skips_empty_entries() {
        let entries = vec![(1, 0.0), (2, 1.0)];
        let (debits, leftover) = plan_spread(&entries, 0.4);
        assert_eq!(debits, vec![(2, 0.4)]);
        assert_eq!(leftover, 0.0);
    }

    #[test]
    fn spread_of_nothing_is_empty() {
        let (debits, leftover) = plan_spread(&[], 0.0);
        assert!(debits.is_empty());
        assert_eq!(leftover, 0.0);
    }

    #[test]
    fn daily_cap_excludes_the_current_call() {
        // 2.0 units spent today including this 0.5-unit call, cap 1.5:
        // prior spend is exactly at the cap.
        assert!(daily_cap_reached(1.5, 2_000_000, 500_000));
        // With a 2.0 cap the prior 1.5 units leave headroom.
        assert!(!daily_cap_reached(2.0, 2_000_000, 500_000));
    }

    #[test]
    fn day_start_is_at_or_before_now() {
        let now = Utc::now();
        let start = local_day_start(now);
        assert!(start <= now);
        assert!(now - start < chrono::Duration::hours(25));
    }
}
