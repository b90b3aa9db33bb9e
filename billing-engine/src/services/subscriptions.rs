//! Seat-based subscriptions.

use crate::models::{
    BillingEvent, CreateEntitySubscription, EntitySubscription, SubscriptionStatus,
};
use crate::pricing::calendar::{add_months, normalize_to_month};
use crate::pricing::proration::{grace_period_charge, mid_cycle_change};
use crate::pricing::tiered::seat_charge;
use crate::pricing::{BulkDiscountRule, BulkPrice, GracePeriodCharge, PlanChangeProration, PricingError};
use crate::services::events::EventSink;
use crate::services::store::BillingStore;
use chrono::{Datelike, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Result of changing the seat count mid-cycle.
#[derive(Debug, Clone)]
pub struct SeatChange {
    pub subscription: EntitySubscription,
    pub proration: PlanChangeProration,
}

/// Result of cancelling with a grace window.
#[derive(Debug, Clone)]
pub struct SubscriptionCancellation {
    pub subscription: EntitySubscription,
    pub final_charge: GracePeriodCharge,
}

/// Result of rolling a subscription into its next cycle.
#[derive(Debug, Clone)]
pub struct SubscriptionRenewal {
    pub subscription: EntitySubscription,
    pub charge: BulkPrice,
}

/// Date one cycle after `date`. Month-end dates stay at month end.
pub fn next_cycle_date(date: NaiveDate, months: i32) -> Result<NaiveDate, PricingError> {
    let target = add_months(date, months)?;
    normalize_to_month(date, target.year(), target.month())
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    events: Arc<dyn EventSink>,
    bulk_rules: Vec<BulkDiscountRule>,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        events: Arc<dyn EventSink>,
        bulk_rules: Vec<BulkDiscountRule>,
    ) -> Self {
        Self {
            store,
            events,
            bulk_rules,
        }
    }

    /// Charge for one full cycle at the current seat count.
    pub fn renewal_amount(&self, subscription: &EntitySubscription) -> Result<BulkPrice, PricingError> {
        seat_charge(
            subscription.seat_count,
            subscription.price_per_seat,
            subscription.cycle().months(),
            &self.bulk_rules,
        )
    }

    async fn load(&self, subscription_id: Uuid) -> Result<EntitySubscription, AppError> {
        self.store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Subscription {} not found", subscription_id))
            })
    }

    fn require_status(
        subscription: &EntitySubscription,
        expected: SubscriptionStatus,
    ) -> Result<(), AppError> {
        if subscription.subscription_status() != expected {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Subscription {} is {}, expected {}",
                subscription.subscription_id,
                subscription.status,
                expected.as_str()
            )));
        }
        Ok(())
    }

    /// Last day covered by the current cycle.
    fn period_end(subscription: &EntitySubscription) -> Result<NaiveDate, PricingError> {
        subscription
            .next_billing_date
            .checked_sub_signed(Duration::days(1))
            .ok_or(PricingError::DateOutOfRange)
            .map(|end| end.max(subscription.current_period_start))
    }

    #[instrument(skip(self, input), fields(entity_id = %input.entity_id, seats = input.seat_count))]
    pub async fn create_subscription(
        &self,
        input: &CreateEntitySubscription,
    ) -> Result<EntitySubscription, AppError> {
        if input.seat_count <= 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Seat count must be positive (got {})",
                input.seat_count
            )));
        }
        if input.price_per_seat < Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Price per seat must not be negative"
            )));
        }

        let next = next_cycle_date(input.start_date, input.billing_cycle.months())?;
        let subscription = self.store.create_subscription(input, next).await?;
        info!(
            subscription_id = %subscription.subscription_id,
            next_billing_date = %next,
            "Subscription created"
        );
        Ok(subscription)
    }

    /// Change the seat count effective `change_date` and report the
    /// proration owed or refunded for the rest of the cycle.
    #[instrument(skip(self), fields(subscription_id = %subscription_id, new_seats = new_seats))]
    pub async fn change_seats(
        &self,
        subscription_id: Uuid,
        new_seats: i32,
        change_date: NaiveDate,
    ) -> Result<SeatChange, AppError> {
        if new_seats <= 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Seat count must be positive (got {})",
                new_seats
            )));
        }

        let mut subscription = self.load(subscription_id).await?;
        Self::require_status(&subscription, SubscriptionStatus::Active)?;

        let old_seats = subscription.seat_count;
        let old_amount = self.renewal_amount(&subscription)?.final_amount;
        subscription.seat_count = new_seats;
        let new_amount = self.renewal_amount(&subscription)?.final_amount;

        let proration = mid_cycle_change(
            old_amount,
            new_amount,
            subscription.current_period_start,
            Self::period_end(&subscription)?,
            change_date,
        )?;

        let subscription = self.store.update_subscription(&subscription).await?;

        info!(old_seats, new_seats, adjustment = ?proration.adjustment, "Seat count changed");
        self.events.publish(BillingEvent::SeatsChanged {
            subscription_id,
            entity_id: subscription.entity_id,
            old_seats,
            new_seats,
        });

        Ok(SeatChange {
            subscription,
            proration,
        })
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn pause(&self, subscription_id: Uuid) -> Result<EntitySubscription, AppError> {
        let mut subscription = self.load(subscription_id).await?;
        Self::require_status(&subscription, SubscriptionStatus::Active)?;
        subscription.status = SubscriptionStatus::Paused.as_str().to_string();
        let subscription = self.store.update_subscription(&subscription).await?;
        info!("Subscription paused");
        Ok(subscription)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn resume(&self, subscription_id: Uuid) -> Result<EntitySubscription, AppError> {
        let mut subscription = self.load(subscription_id).await?;
        Self::require_status(&subscription, SubscriptionStatus::Paused)?;
        subscription.status = SubscriptionStatus::Active.as_str().to_string();
        let subscription = self.store.update_subscription(&subscription).await?;
        info!("Subscription resumed");
        Ok(subscription)
    }

    /// Cancel on `cancellation_date`, billing service through the grace
    /// window (capped at the cycle end).
    #[instrument(skip(self), fields(subscription_id = %subscription_id, grace_days = grace_days))]
    pub async fn cancel(
        &self,
        subscription_id: Uuid,
        cancellation_date: NaiveDate,
        grace_days: u32,
    ) -> Result<SubscriptionCancellation, AppError> {
        let mut subscription = self.load(subscription_id).await?;
        if subscription.subscription_status() == SubscriptionStatus::Canceled {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Subscription {} is already canceled",
                subscription_id
            )));
        }

        let final_charge = grace_period_charge(
            self.renewal_amount(&subscription)?.final_amount,
            subscription.current_period_start,
            Self::period_end(&subscription)?,
            cancellation_date,
            grace_days,
        )?;

        subscription.status = SubscriptionStatus::Canceled.as_str().to_string();
        subscription.canceled_utc = Some(Utc::now());
        let subscription = self.store.update_subscription(&subscription).await?;

        info!(
            service_end = %final_charge.service_end,
            amount = %final_charge.amount,
            "Subscription canceled"
        );
        Ok(SubscriptionCancellation {
            subscription,
            final_charge,
        })
    }

    /// Start the next cycle and return its charge.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn advance_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<SubscriptionRenewal, AppError> {
        let mut subscription = self.load(subscription_id).await?;
        Self::require_status(&subscription, SubscriptionStatus::Active)?;

        let charge = self.renewal_amount(&subscription)?;
        let next = next_cycle_date(subscription.next_billing_date, subscription.cycle().months())?;
        subscription.current_period_start = subscription.next_billing_date;
        subscription.next_billing_date = next;
        let subscription = self.store.update_subscription(&subscription).await?;

        info!(
            next_billing_date = %next,
            amount = %charge.final_amount,
            "Subscription advanced"
        );
        Ok(SubscriptionRenewal {
            subscription,
            charge,
        })
    }

    /// Active subscriptions due on or before `effective_date`.
    pub async fn find_due(
        &self,
        effective_date: NaiveDate,
    ) -> Result<Vec<EntitySubscription>, AppError> {
        self.store.find_subscriptions_due(effective_date).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn month_end_cycles_stay_at_month_end() {
        assert_eq!(next_cycle_date(d(2025, 1, 31), 1).unwrap(), d(2025, 2, 28));
        assert_eq!(next_cycle_date(d(2025, 2, 28), 1).unwrap(), d(2025, 3, 31));
        assert_eq!(next_cycle_date(d(2025, 3, 15), 1).unwrap(), d(2025, 4, 15));
    }

    #[test]
    fn annual_cycle_moves_twelve_months() {
        assert_eq!(next_cycle_date(d(2024, 2, 29), 12).unwrap(), d(2025, 2, 28));
        assert_eq!(next_cycle_date(d(2025, 6, 10), 12).unwrap(), d(2026, 6, 10));
    }
}
