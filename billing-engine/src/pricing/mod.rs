//! Pure pricing math: calendar arithmetic, proration and tier calculators.
//!
//! Nothing in here touches persistence. Every amount is a `Decimal`.

pub mod calendar;
pub mod proration;
pub mod tiered;

use service_core::error::AppError;
use thiserror::Error;

pub use calendar::BillingPeriod;
pub use proration::{GracePeriodCharge, PlanChangeProration, ProrationAdjustment};
pub use tiered::{BulkDiscountRule, BulkPrice, PriceTier};

/// Validation failures raised by the pricing calculators.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("total days must be greater than zero (got {0})")]
    InvalidTotalDays(i64),

    #[error("used days must be between 0 and {total_days} (got {used_days})")]
    UsedDaysOutOfRange { total_days: i64, used_days: i64 },

    #[error("period end {end} is before period start {start}")]
    InvalidPeriod {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    #[error("date {date} is outside the period {start}..={end}")]
    DateOutsidePeriod {
        date: chrono::NaiveDate,
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    #[error("date arithmetic overflowed")]
    DateOutOfRange,

    #[error("quantity must not be negative (got {0})")]
    NegativeQuantity(rust_decimal::Decimal),

    #[error("invalid price tiers: {0}")]
    InvalidTiers(&'static str),
}

impl From<PricingError> for AppError {
    fn from(err: PricingError) -> Self {
        AppError::BadRequest(anyhow::Error::new(err))
    }
}
