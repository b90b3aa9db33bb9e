//! Finds contracts due for billing and aggregates their metered usage.

use crate::models::{Contract, RecordUsage, UsageEvent, UsageEventType};
use crate::services::store::BillingStore;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// UTC midnight at the start of `date`.
pub fn utc_midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Parse a submitted event type. A missing type means an API call.
pub fn parse_event_type(raw: Option<&str>) -> Result<UsageEventType, AppError> {
    match raw {
        None => Ok(UsageEventType::ApiCall),
        Some(s) => UsageEventType::parse(s).ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("Unknown usage event type '{}'", s))
        }),
    }
}

#[derive(Clone)]
pub struct UsageDiscovery {
    store: Arc<dyn BillingStore>,
}

impl UsageDiscovery {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Active contracts whose next billing date is on or before
    /// `effective_date`, oldest due first.
    #[instrument(skip(self), fields(effective_date = %effective_date))]
    pub async fn find_contracts_due(
        &self,
        effective_date: NaiveDate,
        entity_id: Option<Uuid>,
    ) -> Result<Vec<Contract>, AppError> {
        let contracts = self
            .store
            .find_contracts_due(effective_date, entity_id)
            .await?;
        info!(count = contracts.len(), "Found contracts due for billing");
        Ok(contracts)
    }

    /// Total quantity with timestamps in `[period_start, period_end)`.
    #[instrument(skip(self), fields(contract_id = %contract_id))]
    pub async fn aggregate_usage(
        &self,
        contract_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Decimal, AppError> {
        if period_end < period_start {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Usage period end {} is before start {}",
                period_end,
                period_start
            )));
        }

        let total = self
            .store
            .sum_usage(
                contract_id,
                utc_midnight(period_start),
                utc_midnight(period_end),
            )
            .await?;

        debug!(usage = %total, "Aggregated usage");
        Ok(total)
    }

    /// Append a usage event after validating it. Resubmitting an
    /// idempotency key returns the original event.
    #[instrument(skip(self, input), fields(contract_id = %input.contract_id, event_type = input.event_type.as_str()))]
    pub async fn record_usage(&self, input: &RecordUsage) -> Result<UsageEvent, AppError> {
        if input.quantity <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Usage quantity must be positive (got {})",
                input.quantity
            )));
        }
        if matches!(&input.idempotency_key, Some(key) if key.trim().is_empty()) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Idempotency key must not be blank"
            )));
        }

        self.store
            .get_contract(input.contract_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Contract {} not found", input.contract_id))
            })?;

        let event = self.store.insert_usage_event(input).await?;
        debug!(event_id = %event.event_id, "Usage recorded");
        Ok(event)
    }
}
