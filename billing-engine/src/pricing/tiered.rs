//! Tiered usage and bulk-discount pricing calculators.

use super::proration::daily_proration;
use super::PricingError;
use crate::models::money::round_money;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One pricing tier. `up_to` is the cumulative upper bound of the tier;
/// `None` marks the unbounded top tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTier {
    pub up_to: Option<Decimal>,
    pub unit_price: Decimal,
}

impl PriceTier {
    pub fn bounded(up_to: Decimal, unit_price: Decimal) -> Self {
        Self {
            up_to: Some(up_to),
            unit_price,
        }
    }

    pub fn unbounded(unit_price: Decimal) -> Self {
        Self {
            up_to: None,
            unit_price,
        }
    }
}

fn validate_tiers(tiers: &[PriceTier]) -> Result<(), PricingError> {
    if tiers.is_empty() {
        return Err(PricingError::InvalidTiers("at least one tier is required"));
    }
    let mut previous = Decimal::ZERO;
    for (i, tier) in tiers.iter().enumerate() {
        if tier.unit_price < Decimal::ZERO {
            return Err(PricingError::InvalidTiers("tier price must not be negative"));
        }
        match tier.up_to {
            Some(limit) if limit <= previous => {
                return Err(PricingError::InvalidTiers("tier limits must be ascending"));
            }
            Some(limit) => previous = limit,
            None if i + 1 != tiers.len() => {
                return Err(PricingError::InvalidTiers("only the last tier may be unbounded"));
            }
            None => {}
        }
    }
    Ok(())
}

/// Cost of `usage` units consumed tier by tier from the lowest tier up.
///
/// A zero-price tier is a free allotment. Usage past the last bounded tier
/// is priced at that tier's rate.
pub fn tiered_usage_cost(tiers: &[PriceTier], usage: Decimal) -> Result<Decimal, PricingError> {
    if usage < Decimal::ZERO {
        return Err(PricingError::NegativeQuantity(usage));
    }
    validate_tiers(tiers)?;

    let mut remaining = usage;
    let mut lower = Decimal::ZERO;
    let mut cost = Decimal::ZERO;
    let mut last_price = Decimal::ZERO;

    for tier in tiers {
        if remaining <= Decimal::ZERO {
            break;
        }
        last_price = tier.unit_price;
        let consumed = match tier.up_to {
            Some(limit) => (limit - lower).min(remaining),
            None => remaining,
        };
        cost += consumed * tier.unit_price;
        remaining -= consumed;
        if let Some(limit) = tier.up_to {
            lower = limit;
        }
    }

    if remaining > Decimal::ZERO {
        cost += remaining * last_price;
    }

    Ok(round_money(cost))
}

/// Percentage off once `quantity >= min_quantity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkDiscountRule {
    pub min_quantity: Decimal,
    /// Whole percent, e.g. `10` for 10% off.
    pub percent_off: Decimal,
}

/// Bulk pricing breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkPrice {
    pub base_amount: Decimal,
    pub discount_amount: Decimal,
    pub final_amount: Decimal,
    pub applied_rule: Option<BulkDiscountRule>,
}

/// `quantity × unit_price`, less the last satisfied bulk rule.
pub fn bulk_discount_price(
    quantity: Decimal,
    unit_price: Decimal,
    rules: &[BulkDiscountRule],
) -> Result<BulkPrice, PricingError> {
    if quantity < Decimal::ZERO {
        return Err(PricingError::NegativeQuantity(quantity));
    }

    let base_amount = round_money(quantity * unit_price);
    let applied_rule = rules
        .iter()
        .rev()
        .find(|rule| quantity >= rule.min_quantity)
        .cloned();

    let discount_amount = applied_rule
        .as_ref()
        .map(|rule| round_money(base_amount * rule.percent_off / Decimal::ONE_HUNDRED))
        .unwrap_or(Decimal::ZERO);

    Ok(BulkPrice {
        base_amount,
        discount_amount,
        final_amount: base_amount - discount_amount,
        applied_rule,
    })
}

/// Flat fee charged for part of a period.
pub fn flat_fee_proration(
    amount: Decimal,
    total_days: i64,
    used_days: i64,
) -> Result<Decimal, PricingError> {
    daily_proration(amount, total_days, used_days)
}

/// Seat charge for one billing cycle of `cycle_months` months.
pub fn seat_charge(
    seats: i32,
    price_per_seat: Decimal,
    cycle_months: i32,
    rules: &[BulkDiscountRule],
) -> Result<BulkPrice, PricingError> {
    let quantity = Decimal::from(seats);
    bulk_discount_price(quantity, price_per_seat * Decimal::from(cycle_months), rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn api_tiers() -> Vec<PriceTier> {
        vec![
            PriceTier::bounded(dec!(1000), dec!(0)),
            PriceTier::bounded(dec!(1000000), dec!(0.002)),
            PriceTier::unbounded(dec!(0.001)),
        ]
    }

    fn ten_percent_at_100() -> Vec<BulkDiscountRule> {
        vec![BulkDiscountRule {
            min_quantity: dec!(100),
            percent_off: dec!(10),
        }]
    }

    #[test]
    fn tiered_cost_crosses_all_tiers() {
        let cost = tiered_usage_cost(&api_tiers(), dec!(1500000)).unwrap();
        assert_eq!(cost, dec!(2498));
    }

    #[test]
    fn free_allotment_costs_nothing() {
        assert_eq!(tiered_usage_cost(&api_tiers(), dec!(1000)).unwrap(), Decimal::ZERO);
        assert_eq!(tiered_usage_cost(&api_tiers(), dec!(0)).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn tier_boundary_is_inclusive_of_limit() {
        // 1001 units: one billable unit in the second tier.
        assert_eq!(tiered_usage_cost(&api_tiers(), dec!(1001)).unwrap(), dec!(0.002));
    }

    #[test]
    fn overflow_past_bounded_tiers_uses_last_rate() {
        let tiers = vec![PriceTier::bounded(dec!(10), dec!(1))];
        assert_eq!(tiered_usage_cost(&tiers, dec!(15)).unwrap(), dec!(15));
    }

    #[test]
    fn rejects_malformed_tiers() {
        assert!(tiered_usage_cost(&[], dec!(1)).is_err());
        let descending = vec![
            PriceTier::bounded(dec!(100), dec!(1)),
            PriceTier::bounded(dec!(50), dec!(1)),
        ];
        assert!(tiered_usage_cost(&descending, dec!(1)).is_err());
        let unbounded_first = vec![
            PriceTier::unbounded(dec!(1)),
            PriceTier::bounded(dec!(50), dec!(1)),
        ];
        assert!(tiered_usage_cost(&unbounded_first, dec!(1)).is_err());
        assert!(tiered_usage_cost(&api_tiers(), dec!(-1)).is_err());
    }

    #[test]
    fn bulk_discount_applies_at_threshold() {
        let price = bulk_discount_price(dec!(150), dec!(10), &ten_percent_at_100()).unwrap();
        assert_eq!(price.base_amount, dec!(1500));
        assert_eq!(price.discount_amount, dec!(150));
        assert_eq!(price.final_amount, dec!(1350));

        let exact = bulk_discount_price(dec!(100), dec!(10), &ten_percent_at_100()).unwrap();
        assert_eq!(exact.discount_amount, dec!(100));
    }

    #[test]
    fn bulk_discount_below_threshold_is_zero() {
        let price = bulk_discount_price(dec!(99), dec!(10), &ten_percent_at_100()).unwrap();
        assert_eq!(price.discount_amount, Decimal::ZERO);
        assert_eq!(price.final_amount, dec!(990));
        assert!(price.applied_rule.is_none());
    }

    #[test]
    fn last_satisfied_rule_wins() {
        let rules = vec![
            BulkDiscountRule {
                min_quantity: dec!(10),
                percent_off: dec!(5),
            },
            BulkDiscountRule {
                min_quantity: dec!(50),
                percent_off: dec!(15),
            },
        ];
        let price = bulk_discount_price(dec!(60), dec!(1), &rules).unwrap();
        assert_eq!(price.discount_amount, dec!(9));
    }

    #[test]
    fn annual_seat_charge_bills_twelve_months() {
        let price = seat_charge(5, dec!(8), 12, &[]).unwrap();
        assert_eq!(price.final_amount, dec!(480));
    }

    #[test]
    fn flat_fee_delegates_to_daily_proration() {
        assert_eq!(flat_fee_proration(dec!(310), 31, 10).unwrap(), dec!(100));
    }
}
