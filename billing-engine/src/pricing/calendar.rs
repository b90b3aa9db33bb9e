//! Calendar utilities for billing periods.
//!
//! Month arithmetic clamps to the last day of the target month: adding one
//! month to Jan 31 yields Feb 28 (or Feb 29 in a leap year).

use super::PricingError;
use chrono::{Datelike, NaiveDate};

pub fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// Days in `month` (1-12) of `year`. Returns 0 for an invalid month.
pub fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

pub fn is_last_day_of_month(date: NaiveDate) -> bool {
    date.day() == days_in_month(date.year(), date.month())
}

/// Inclusive day count: the same date twice is one day.
pub fn days_between_inclusive(start: NaiveDate, end: NaiveDate) -> i64 {
    (end - start).num_days() + 1
}

fn ymd(year: i32, month: u32, day: u32) -> Result<NaiveDate, PricingError> {
    NaiveDate::from_ymd_opt(year, month, day).ok_or(PricingError::DateOutOfRange)
}

/// Shift `date` by `months`, keeping `target_day` where the month allows it.
pub fn add_months_with_day(
    date: NaiveDate,
    months: i32,
    target_day: u32,
) -> Result<NaiveDate, PricingError> {
    let index = date.year() as i64 * 12 + date.month0() as i64 + months as i64;
    let year = i32::try_from(index.div_euclid(12)).map_err(|_| PricingError::DateOutOfRange)?;
    let month = index.rem_euclid(12) as u32 + 1;
    let day = target_day.clamp(1, days_in_month(year, month).max(1));
    ymd(year, month, day)
}

/// Shift `date` by `months`, clamping the day to the target month.
pub fn add_months(date: NaiveDate, months: i32) -> Result<NaiveDate, PricingError> {
    add_months_with_day(date, months, date.day())
}

/// Move `date` into `year`/`month`.
///
/// A month-end date stays a month-end date; any other day is kept or
/// clamped to the target month's last day, whichever is smaller.
pub fn normalize_to_month(date: NaiveDate, year: i32, month: u32) -> Result<NaiveDate, PricingError> {
    let last = days_in_month(year, month);
    if last == 0 {
        return Err(PricingError::DateOutOfRange);
    }
    let day = if is_last_day_of_month(date) {
        last
    } else {
        date.day().min(last)
    };
    ymd(year, month, day)
}

/// A billing period. `start` is inclusive and `end` exclusive for usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// True when the contract had no next billing date and the run's
    /// effective date was used as the period end.
    pub used_fallback: bool,
}

/// Period ending on the contract's next billing date (or `effective_date`
/// when it has none) and starting one calendar month earlier.
pub fn billing_period(
    next_billing_date: Option<NaiveDate>,
    effective_date: NaiveDate,
) -> Result<BillingPeriod, PricingError> {
    let (end, used_fallback) = match next_billing_date {
        Some(date) => (date, false),
        None => (effective_date, true),
    };
    let start = add_months(end, -1)?;
    Ok(BillingPeriod {
        start,
        end,
        used_fallback,
    })
}

/// Next billing date after a successful run on `effective_date`.
///
/// The day is `min(original day, last day of target month)`, where the
/// original day is the contract's anchor day if it has one.
pub fn next_billing_date(
    effective_date: NaiveDate,
    anchor_day: Option<u32>,
) -> Result<NaiveDate, PricingError> {
    let original_day = anchor_day.unwrap_or_else(|| effective_date.day());
    add_months_with_day(effective_date, 1, original_day)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn leap_years() {
        assert!(is_leap_year(2024));
        assert!(is_leap_year(2000));
        assert!(!is_leap_year(1900));
        assert!(!is_leap_year(2025));
    }

    #[test]
    fn february_length_follows_leap_rule() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2025, 2), 28);
        assert_eq!(days_in_month(2025, 4), 30);
        assert_eq!(days_in_month(2025, 12), 31);
        assert_eq!(days_in_month(2025, 13), 0);
    }

    #[test]
    fn inclusive_day_count() {
        assert_eq!(days_between_inclusive(d(2025, 1, 1), d(2025, 1, 1)), 1);
        assert_eq!(days_between_inclusive(d(2025, 1, 1), d(2025, 1, 31)), 31);
        assert_eq!(days_between_inclusive(d(2024, 2, 1), d(2024, 2, 29)), 29);
    }

    #[test]
    fn add_months_clamps_month_end() {
        assert_eq!(add_months(d(2025, 1, 31), 1).unwrap(), d(2025, 2, 28));
        assert_eq!(add_months(d(2024, 1, 31), 1).unwrap(), d(2024, 2, 29));
        assert_eq!(add_months(d(2025, 3, 31), -1).unwrap(), d(2025, 2, 28));
        assert_eq!(add_months(d(2025, 5, 31), 1).unwrap(), d(2025, 6, 30));
    }

    #[test]
    fn add_months_rolls_year() {
        assert_eq!(add_months(d(2025, 12, 15), 1).unwrap(), d(2026, 1, 15));
        assert_eq!(add_months(d(2025, 1, 15), -1).unwrap(), d(2024, 12, 15));
        assert_eq!(add_months(d(2025, 6, 30), 12).unwrap(), d(2026, 6, 30));
    }

    #[test]
    fn normalize_keeps_month_end() {
        assert_eq!(normalize_to_month(d(2025, 2, 28), 2025, 3).unwrap(), d(2025, 3, 31));
        assert_eq!(normalize_to_month(d(2025, 4, 30), 2025, 5).unwrap(), d(2025, 5, 31));
        assert_eq!(normalize_to_month(d(2025, 1, 30), 2025, 2).unwrap(), d(2025, 2, 28));
        assert_eq!(normalize_to_month(d(2025, 1, 15), 2025, 2).unwrap(), d(2025, 2, 15));
        assert!(normalize_to_month(d(2025, 1, 15), 2025, 0).is_err());
    }

    #[test]
    fn period_starts_one_month_before_end() {
        let period = billing_period(Some(d(2025, 3, 31)), d(2025, 4, 2)).unwrap();
        assert_eq!(period.start, d(2025, 2, 28));
        assert_eq!(period.end, d(2025, 3, 31));
        assert!(!period.used_fallback);
    }

    #[test]
    fn period_falls_back_to_effective_date() {
        let period = billing_period(None, d(2025, 7, 15)).unwrap();
        assert_eq!(period.start, d(2025, 6, 15));
        assert_eq!(period.end, d(2025, 7, 15));
        assert!(period.used_fallback);
    }

    #[test]
    fn next_billing_date_month_end_rollover() {
        assert_eq!(next_billing_date(d(2025, 1, 31), None).unwrap(), d(2025, 2, 28));
        assert_eq!(next_billing_date(d(2024, 1, 31), None).unwrap(), d(2024, 2, 29));
        assert_eq!(next_billing_date(d(2025, 12, 31), None).unwrap(), d(2026, 1, 31));
    }

    #[test]
    fn anchor_day_restores_month_end_after_february() {
        let feb = next_billing_date(d(2025, 1, 31), Some(31)).unwrap();
        assert_eq!(feb, d(2025, 2, 28));
        let mar = next_billing_date(feb, Some(31)).unwrap();
        assert_eq!(mar, d(2025, 3, 31));
        let apr = next_billing_date(mar, Some(31)).unwrap();
        assert_eq!(apr, d(2025, 4, 30));
    }

    #[test]
    fn no_drift_below_clamp_over_a_year() {
        let mut date = d(2025, 1, 31);
        for _ in 0..12 {
            let next = next_billing_date(date, Some(31)).unwrap();
            assert!(is_last_day_of_month(next));
            date = next;
        }
        assert_eq!(date, d(2026, 1, 31));
    }
}
