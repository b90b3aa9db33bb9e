//! Billing job model.

use crate::models::money::fixed4;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Billing job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => JobStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// What started a billing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTrigger {
    Scheduled,
    Manual,
    Single,
}

impl JobTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTrigger::Scheduled => "scheduled",
            JobTrigger::Manual => "manual",
            JobTrigger::Single => "single",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "manual" => JobTrigger::Manual,
            "single" => JobTrigger::Single,
            _ => JobTrigger::Scheduled,
        }
    }
}

/// Reason recorded when a job is cancelled.
pub const CANCELLED_REASON: &str = "Cancelled by user";

/// Reason recorded when a job stops because the service is shutting down.
pub const SHUTDOWN_REASON: &str = "Interrupted by service shutdown";

/// One billing run for a reference date.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingJob {
    pub job_id: Uuid,
    pub as_of_date: NaiveDate,
    pub status: String,
    pub trigger_type: String,
    pub target_entity_id: Option<Uuid>,
    pub total_customers: i32,
    pub processed_customers: i32,
    pub skipped_customers: i32,
    pub invoices_created: i32,
    pub error_message: Option<String>,
    #[sqlx(json)]
    pub errors: Vec<String>,
    pub started_utc: Option<DateTime<Utc>>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl BillingJob {
    pub fn job_status(&self) -> JobStatus {
        JobStatus::from_string(&self.status)
    }

    pub fn trigger(&self) -> JobTrigger {
        JobTrigger::from_string(&self.trigger_type)
    }
}

/// Input for creating a billing job.
#[derive(Debug, Clone)]
pub struct CreateBillingJob {
    pub as_of_date: NaiveDate,
    pub trigger: JobTrigger,
    pub target_entity_id: Option<Uuid>,
}

/// Counters persisted after each contract.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobProgress {
    pub total_customers: i32,
    pub processed_customers: i32,
    pub skipped_customers: i32,
    pub invoices_created: i32,
    pub errors: Vec<String>,
}

/// How `acquire_or_return` resolved the job for a date.
#[derive(Debug, Clone)]
pub enum JobAcquisition {
    /// A fresh `pending` job (first run, or retry after failure).
    Created(BillingJob),
    /// The date was already billed; nothing to do.
    AlreadyCompleted(BillingJob),
    /// Another invocation holds the date.
    InProgress(BillingJob),
}

impl JobAcquisition {
    pub fn job(&self) -> &BillingJob {
        match self {
            JobAcquisition::Created(job)
            | JobAcquisition::AlreadyCompleted(job)
            | JobAcquisition::InProgress(job) => job,
        }
    }
}

/// Result returned from every billing run, including partial failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingRunSummary {
    pub success: bool,
    pub job_id: Uuid,
    pub status: JobStatus,
    pub invoices_created: i32,
    pub total_customers: i32,
    pub processed_customers: i32,
    pub skipped_customers: i32,
    #[serde(with = "fixed4")]
    pub amount_invoiced: Decimal,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BillingRunSummary {
    /// Summary of a job without any work done by the current invocation:
    /// counts come from the job, but nothing new was invoiced.
    pub fn from_job(job: &BillingJob, success: bool, error: Option<String>) -> Self {
        Self {
            success,
            job_id: job.job_id,
            status: job.job_status(),
            invoices_created: 0,
            total_customers: job.total_customers,
            processed_customers: job.processed_customers,
            skipped_customers: job.skipped_customers,
            amount_invoiced: Decimal::ZERO,
            errors: job.errors.clone(),
            error,
        }
    }
}
