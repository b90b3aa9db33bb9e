//! Domain events published to the notification sink.

use crate::models::money::fixed4;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Billing event, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BillingEvent {
    JobStarted {
        job_id: Uuid,
        as_of_date: NaiveDate,
        trigger: String,
    },
    JobCompleted {
        job_id: Uuid,
        as_of_date: NaiveDate,
        invoices_created: i32,
        skipped_customers: i32,
    },
    JobFailed {
        job_id: Uuid,
        as_of_date: NaiveDate,
        error: String,
    },
    JobCancelled {
        job_id: Uuid,
        as_of_date: NaiveDate,
    },
    InvoiceCreated {
        invoice_id: Uuid,
        invoice_number: String,
        contract_id: Uuid,
        customer_id: Uuid,
        #[serde(with = "fixed4")]
        total: Decimal,
        currency: String,
    },
    CreditsApplied {
        customer_id: Uuid,
        invoice_id: Option<Uuid>,
        #[serde(with = "fixed4")]
        amount: Decimal,
    },
    CreditsReversed {
        invoice_id: Uuid,
        #[serde(with = "fixed4")]
        amount: Decimal,
        credits_issued: usize,
    },
    EntityCreditsDeducted {
        entity_id: Uuid,
        #[serde(with = "fixed4")]
        amount: Decimal,
        #[serde(with = "fixed4")]
        remaining: Decimal,
    },
    SeatsChanged {
        subscription_id: Uuid,
        entity_id: Uuid,
        old_seats: i32,
        new_seats: i32,
    },
}

impl BillingEvent {
    /// Event type label, matching the serialized `type` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            BillingEvent::JobStarted { .. } => "job_started",
            BillingEvent::JobCompleted { .. } => "job_completed",
            BillingEvent::JobFailed { .. } => "job_failed",
            BillingEvent::JobCancelled { .. } => "job_cancelled",
            BillingEvent::InvoiceCreated { .. } => "invoice_created",
            BillingEvent::CreditsApplied { .. } => "credits_applied",
            BillingEvent::CreditsReversed { .. } => "credits_reversed",
            BillingEvent::EntityCreditsDeducted { .. } => "entity_credits_deducted",
            BillingEvent::SeatsChanged { .. } => "seats_changed",
        }
    }
}
