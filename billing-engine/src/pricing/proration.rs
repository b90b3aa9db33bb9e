//! Proration engine.
//!
//! Day counts are inclusive on both ends. Amounts are rounded to four
//! fraction digits except where an input passes through unchanged.

use super::calendar::days_between_inclusive;
use super::PricingError;
use crate::models::money::round_money;
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// `amount × used_days / total_days`.
///
/// A full period returns `amount` unchanged and an empty one returns zero,
/// so neither case picks up rounding drift.
pub fn daily_proration(
    amount: Decimal,
    total_days: i64,
    used_days: i64,
) -> Result<Decimal, PricingError> {
    if total_days <= 0 {
        return Err(PricingError::InvalidTotalDays(total_days));
    }
    if used_days < 0 || used_days > total_days {
        return Err(PricingError::UsedDaysOutOfRange {
            total_days,
            used_days,
        });
    }
    if used_days == total_days {
        return Ok(amount);
    }
    if used_days == 0 {
        return Ok(Decimal::ZERO);
    }

    Ok(round_money(
        amount * Decimal::from(used_days) / Decimal::from(total_days),
    ))
}

/// Net adjustment produced by a plan change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "amount", rename_all = "snake_case")]
pub enum ProrationAdjustment {
    /// The customer owes this much for the upgraded remainder.
    ChargeDue(Decimal),
    /// The customer is owed this much for the downgraded remainder.
    CreditDue(Decimal),
    None,
}

/// Breakdown of a mid-cycle plan change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanChangeProration {
    pub total_days: i64,
    pub days_on_old_plan: i64,
    pub days_on_new_plan: i64,
    pub old_plan_charge: Decimal,
    pub new_plan_charge: Decimal,
    pub total_charge: Decimal,
    pub adjustment: ProrationAdjustment,
}

fn check_period(start: NaiveDate, end: NaiveDate) -> Result<(), PricingError> {
    if end < start {
        return Err(PricingError::InvalidPeriod { start, end });
    }
    Ok(())
}

fn check_within(date: NaiveDate, start: NaiveDate, end: NaiveDate) -> Result<(), PricingError> {
    if date < start || date > end {
        return Err(PricingError::DateOutsidePeriod { date, start, end });
    }
    Ok(())
}

/// Split a period between two plans at `change_date`.
///
/// Days from the period start through the change date (inclusive) bill at
/// the old amount; the rest of the period bills at the new amount. The
/// difference over the new-plan days is reported as a charge or credit,
/// always as a non-negative magnitude.
pub fn mid_cycle_change(
    old_amount: Decimal,
    new_amount: Decimal,
    period_start: NaiveDate,
    period_end: NaiveDate,
    change_date: NaiveDate,
) -> Result<PlanChangeProration, PricingError> {
    check_period(period_start, period_end)?;
    check_within(change_date, period_start, period_end)?;

    let total_days = days_between_inclusive(period_start, period_end);
    let days_on_old_plan = days_between_inclusive(period_start, change_date);
    let days_on_new_plan = total_days - days_on_old_plan;

    let old_plan_charge = daily_proration(old_amount, total_days, days_on_old_plan)?;
    let new_plan_charge = daily_proration(new_amount, total_days, days_on_new_plan)?;

    let delta = daily_proration((new_amount - old_amount).abs(), total_days, days_on_new_plan)?;
    let adjustment = if delta.is_zero() {
        ProrationAdjustment::None
    } else if new_amount > old_amount {
        ProrationAdjustment::ChargeDue(delta)
    } else {
        ProrationAdjustment::CreditDue(delta)
    };

    Ok(PlanChangeProration {
        total_days,
        days_on_old_plan,
        days_on_new_plan,
        old_plan_charge,
        new_plan_charge,
        total_charge: old_plan_charge + new_plan_charge,
        adjustment,
    })
}

/// Charge owed when service ends partway through a period with a grace window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GracePeriodCharge {
    pub total_days: i64,
    pub billable_days: i64,
    pub service_end: NaiveDate,
    pub amount: Decimal,
}

/// Bill from the period start through `cancellation_date + grace_days`,
/// capped at the period end.
pub fn grace_period_charge(
    amount: Decimal,
    period_start: NaiveDate,
    period_end: NaiveDate,
    cancellation_date: NaiveDate,
    grace_days: u32,
) -> Result<GracePeriodCharge, PricingError> {
    check_period(period_start, period_end)?;
    check_within(cancellation_date, period_start, period_end)?;

    let grace_end = cancellation_date
        .checked_add_signed(Duration::days(grace_days as i64))
        .ok_or(PricingError::DateOutOfRange)?;
    let service_end = grace_end.min(period_end);

    let total_days = days_between_inclusive(period_start, period_end);
    let billable_days = days_between_inclusive(period_start, service_end);

    Ok(GracePeriodCharge {
        total_days,
        billable_days,
        service_end,
        amount: daily_proration(amount, total_days, billable_days)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn full_period_returns_input_exactly() {
        let amount = dec!(99.999999);
        assert_eq!(daily_proration(amount, 31, 31).unwrap(), amount);
    }

    #[test]
    fn zero_days_is_zero() {
        assert_eq!(daily_proration(dec!(100), 30, 0).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn partial_period_is_proportional() {
        assert_eq!(daily_proration(dec!(300), 30, 10).unwrap(), dec!(100));
        assert_eq!(daily_proration(dec!(100), 3, 1).unwrap(), dec!(33.3333));
    }

    #[test]
    fn rejects_invalid_day_counts() {
        assert_eq!(
            daily_proration(dec!(10), 0, 0),
            Err(PricingError::InvalidTotalDays(0))
        );
        assert_eq!(
            daily_proration(dec!(10), 30, 31),
            Err(PricingError::UsedDaysOutOfRange {
                total_days: 30,
                used_days: 31
            })
        );
        assert!(daily_proration(dec!(10), 30, -1).is_err());
    }

    #[test]
    fn upgrade_mid_cycle_is_charge_due() {
        // 30-day period, change on day 10: 10 days old plan, 20 days new plan.
        let result =
            mid_cycle_change(dec!(30), dec!(60), d(2025, 4, 1), d(2025, 4, 30), d(2025, 4, 10))
                .unwrap();
        assert_eq!(result.total_days, 30);
        assert_eq!(result.days_on_old_plan, 10);
        assert_eq!(result.days_on_new_plan, 20);
        assert_eq!(result.old_plan_charge, dec!(10));
        assert_eq!(result.new_plan_charge, dec!(40));
        assert_eq!(result.total_charge, dec!(50));
        assert_eq!(result.adjustment, ProrationAdjustment::ChargeDue(dec!(20)));
    }

    #[test]
    fn downgrade_mid_cycle_is_credit_due_magnitude() {
        let result =
            mid_cycle_change(dec!(60), dec!(30), d(2025, 4, 1), d(2025, 4, 30), d(2025, 4, 10))
                .unwrap();
        assert_eq!(result.adjustment, ProrationAdjustment::CreditDue(dec!(20)));
    }

    #[test]
    fn same_price_has_no_adjustment() {
        let result =
            mid_cycle_change(dec!(50), dec!(50), d(2025, 4, 1), d(2025, 4, 30), d(2025, 4, 15))
                .unwrap();
        assert_eq!(result.adjustment, ProrationAdjustment::None);
        assert_eq!(result.total_charge, dec!(50));
    }

    #[test]
    fn change_outside_period_is_rejected() {
        let err =
            mid_cycle_change(dec!(10), dec!(20), d(2025, 4, 1), d(2025, 4, 30), d(2025, 5, 1))
                .unwrap_err();
        assert!(matches!(err, PricingError::DateOutsidePeriod { .. }));
    }

    #[test]
    fn grace_period_extends_billable_days() {
        let charge =
            grace_period_charge(dec!(300), d(2025, 4, 1), d(2025, 4, 30), d(2025, 4, 5), 5)
                .unwrap();
        assert_eq!(charge.service_end, d(2025, 4, 10));
        assert_eq!(charge.billable_days, 10);
        assert_eq!(charge.amount, dec!(100));
    }

    #[test]
    fn grace_period_is_capped_at_period_end() {
        let charge =
            grace_period_charge(dec!(300), d(2025, 4, 1), d(2025, 4, 30), d(2025, 4, 28), 14)
                .unwrap();
        assert_eq!(charge.service_end, d(2025, 4, 30));
        assert_eq!(charge.amount, dec!(300));
    }
}
