//! Seat-based subscription model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "paused" => SubscriptionStatus::Paused,
            "canceled" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::Active,
        }
    }
}

/// Seat billing cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeatBillingCycle {
    Monthly,
    Annual,
}

impl SeatBillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeatBillingCycle::Monthly => "monthly",
            SeatBillingCycle::Annual => "annual",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "annual" => SeatBillingCycle::Annual,
            _ => SeatBillingCycle::Monthly,
        }
    }

    pub fn months(&self) -> i32 {
        match self {
            SeatBillingCycle::Monthly => 1,
            SeatBillingCycle::Annual => 12,
        }
    }
}

/// Seat-based billing state for an entity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EntitySubscription {
    pub subscription_id: Uuid,
    pub entity_id: Uuid,
    pub seat_count: i32,
    pub price_per_seat: Decimal,
    pub billing_cycle: String,
    pub current_period_start: NaiveDate,
    pub next_billing_date: NaiveDate,
    pub status: String,
    pub canceled_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl EntitySubscription {
    pub fn subscription_status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_string(&self.status)
    }

    pub fn cycle(&self) -> SeatBillingCycle {
        SeatBillingCycle::from_string(&self.billing_cycle)
    }
}

/// Input for creating a subscription.
#[derive(Debug, Clone)]
pub struct CreateEntitySubscription {
    pub entity_id: Uuid,
    pub seat_count: i32,
    pub price_per_seat: Decimal,
    pub billing_cycle: SeatBillingCycle,
    pub start_date: NaiveDate,
}
