//! Contract model.

use crate::pricing::PriceTier;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Contract status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Active,
    Suspended,
    Terminated,
}

impl ContractStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractStatus::Active => "active",
            ContractStatus::Suspended => "suspended",
            ContractStatus::Terminated => "terminated",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "suspended" => ContractStatus::Suspended,
            "terminated" => ContractStatus::Terminated,
            _ => ContractStatus::Active,
        }
    }
}

/// Pay-as-you-go billing agreement for an entity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Contract {
    pub contract_id: Uuid,
    pub entity_id: Uuid,
    pub name: String,
    pub status: String,
    pub currency: String,
    pub base_fee: Decimal,
    pub overage_fee: Decimal,
    pub discount_rate: Decimal,
    pub min_commit_calls: Decimal,
    /// Graduated usage pricing; empty means flat overage pricing.
    #[sqlx(json)]
    pub usage_tiers: Vec<PriceTier>,
    pub start_date: NaiveDate,
    pub billing_anchor_day: Option<i32>,
    /// Cycle number of the next invoice, starting at 1.
    pub billing_cycle: i32,
    pub next_billing_date: Option<NaiveDate>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Contract {
    pub fn contract_status(&self) -> ContractStatus {
        ContractStatus::from_string(&self.status)
    }

    /// Anchor day as a calendar day, if one is configured and sane.
    pub fn anchor_day(&self) -> Option<u32> {
        self.billing_anchor_day
            .filter(|d| (1..=31).contains(d))
            .map(|d| d as u32)
    }
}

/// Input for creating a contract.
#[derive(Debug, Clone)]
pub struct CreateContract {
    pub entity_id: Uuid,
    pub name: String,
    pub currency: String,
    pub base_fee: Decimal,
    pub overage_fee: Decimal,
    pub discount_rate: Decimal,
    pub min_commit_calls: Decimal,
    pub usage_tiers: Vec<PriceTier>,
    pub start_date: NaiveDate,
    pub billing_anchor_day: Option<i32>,
    pub next_billing_date: Option<NaiveDate>,
}

impl CreateContract {
    /// Anchor day to persist: the explicit one, else the day of the first
    /// due date, else the start day. Keeps month-end contracts at month end
    /// once a short month has clamped their due date.
    pub fn resolved_anchor_day(&self) -> i32 {
        self.billing_anchor_day.unwrap_or_else(|| {
            self.next_billing_date.unwrap_or(self.start_date).day() as i32
        })
    }
}
