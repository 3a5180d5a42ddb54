//! Billing-rule selection and cost computation.
//!
//! Pure functions: the repository fetches the candidate rules, and these
//! helpers decide which applies and what the call costs.

use crate::db::models::{billing_rules::BillingRule, billing_rules::BillingType, usage::TokenUsage};
use crate::types::GroupId;

/// Micro-units per currency unit.
const MICROS: f64 = 1_000_000.0;

/// Picks the applicable rule from the fetched candidates.
///
/// Precedence: the primary group pair beats the fallback pair, an exact
/// provider + model cell beats the wildcard cell, and among equals the
/// highest rule id wins (most recently defined pricing).
pub fn select_billing_rule<'a>(rules: &'a [BillingRule], primary: (GroupId, GroupId)) -> Option<&'a BillingRule> {
    rules.iter().max_by_key(|rule| {
        let primary_pair = rule.auth_group_id == primary.0 && rule.user_group_id == primary.1;
        (primary_pair, rule.is_exact_model(), rule.id)
    })
}

/// Cost of one successful call under `rule`, in micros. Never negative.
pub fn cost_micros(rule: &BillingRule, tokens: &TokenUsage) -> i64 {
    let cost = match rule.billing_type {
        BillingType::PerRequest => rule.price_per_request.unwrap_or(0.0) * MICROS,
        BillingType::PerToken => {
            // Per-token prices are stored pre-scaled: tokens * price is
            // already in micros. Cached reads are priced separately.
            tokens.input_tokens as f64 * rule.price_input_token.unwrap_or(0.0)
                + tokens.output_tokens as f64 * rule.price_output_token.unwrap_or(0.0)
                + tokens.cached_tokens as f64 * rule.price_cache_read_token.unwrap_or(0.0)
        }
    };
    if !cost.is_finite() || cost <= 0.0 {
        return 0;
    }
    cost.round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rule(id: i64, pair: (GroupId, GroupId), provider: &str, model: &str) -> BillingRule {
        BillingRule {
            id,
            auth_group_id: pair.0,
            user_group_id: pair.1,
            provider: provider.to_string(),
            model: model.to_string(),
            billing_type: BillingType::PerToken,
            price_per_request: None,
            price_input_token: Some(2.0),
            price_output_token: Some(6.0),
            price_cache_read_token: Some(1.0),
            is_enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn primary_pair_beats_fallback_pair() {
        let rules = vec![rule(9, (2, 2), "openai", "gpt-4o"), rule(1, (1, 1), "", "")];
        let selected = select_billing_rule(&rules, (1, 1)).unwrap();
        assert_eq!(selected.id, 1);
    }

    #[test]
    fn exact_model_beats_wildcard_within_a_pair() {
        let rules = vec![rule(9, (1, 1), "", ""), rule(3, (1, 1), "openai", "gpt-4o")];
        let selected = select_billing_rule(&rules, (1, 1)).unwrap();
        assert_eq!(selected.id, 3);
    }

    #[test]
    fn highest_id_breaks_remaining_ties() {
        let rules = vec![
            rule(3, (1, 1), "openai", "gpt-4o"),
            rule(8, (1, 1), "openai", "gpt-4o"),
            rule(5, (1, 1), "openai", "gpt-4o"),
        ];
        assert_eq!(select_billing_rule(&rules, (1, 1)).unwrap().id, 8);
    }

    #[test]
    fn no_candidates_selects_nothing() {
        assert!(select_billing_rule(&[], (1, 1)).is_none());
    }

    #[test]
    fn per_request_price_converts_to_micros() {
        let mut flat = rule(1, (1, 1), "openai", "gpt-4o");
        flat.billing_type = BillingType::PerRequest;
        flat.price_per_request = Some(0.25);
        assert_eq!(cost_micros(&flat, &TokenUsage::default()), 250_000);
    }

    #[test]
    fn per_token_price_sums_the_components() {
        let tokens = TokenUsage {
            input_tokens: 100,
            output_tokens: 10,
            cached_tokens: 40,
            ..TokenUsage::default()
        };
        // 100*2 + 10*6 + 40*1
        assert_eq!(cost_micros(&rule(1, (1, 1), "openai", "gpt-4o"), &tokens), 300);
    }

    #[test]
    fn missing_prices_cost_nothing() {
        let mut unpriced = rule(1, (1, 1), "openai", "gpt-4o");
        unpriced.price_input_token = None;
        unpriced.price_output_token = None;
        unpriced.price_cache_read_token = None;
        let tokens = TokenUsage {
            input_tokens: 100,
            output_tokens: 100,
            ..TokenUsage::default()
        };
        assert_eq!(cost_micros(&unpriced, &tokens), 0);
    }
}
