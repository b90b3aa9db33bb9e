//! Persistence interface consumed by the billing core.
//!
//! Compound writes (`commit_invoice`, `apply_credit_mutations`,
//! `grant_entity_credits`, `consume_entity_credits`) are atomic in every
//! implementation. Conditional updates return `None`/`false` when their
//! guard does not hold instead of erroring.

use crate::models::{
    BillingJob, CommittedInvoice, Contract, CreateBillingJob, CreateContract,
    CreateEntitySubscription, Credit, CreditApplication, EntityCreditBalance, EntitySubscription,
    GrantCredit, Invoice, InvoiceDraft, InvoiceLine, JobProgress, JobStatus, RecordUsage,
    UsageEvent,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // ------------------------------------------------------------------
    // Billing jobs
    // ------------------------------------------------------------------

    async fn find_job_by_date(&self, as_of_date: NaiveDate)
        -> Result<Option<BillingJob>, AppError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<BillingJob>, AppError>;

    /// Most recent jobs first.
    async fn list_jobs(&self, limit: i64) -> Result<Vec<BillingJob>, AppError>;

    /// Insert a `pending` job. Fails with `AppError::Conflict` when a job
    /// already exists for the date.
    async fn insert_job(&self, input: &CreateBillingJob) -> Result<BillingJob, AppError>;

    async fn delete_job(&self, job_id: Uuid) -> Result<bool, AppError>;

    /// Move a job to `to` only if its current status is one of `from`.
    /// Sets `started_utc` on entering `running` and `completed_utc` on
    /// entering a terminal state.
    async fn transition_job(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        error_message: Option<String>,
    ) -> Result<Option<BillingJob>, AppError>;

    async fn update_job_progress(&self, job_id: Uuid, progress: &JobProgress)
        -> Result<(), AppError>;

    // ------------------------------------------------------------------
    // Contracts
    // ------------------------------------------------------------------

    async fn create_contract(&self, input: &CreateContract) -> Result<Contract, AppError>;

    async fn get_contract(&self, contract_id: Uuid) -> Result<Option<Contract>, AppError>;

    /// Active contracts with `next_billing_date <= effective_date`, oldest
    /// due first.
    async fn find_contracts_due(
        &self,
        effective_date: NaiveDate,
        entity_id: Option<Uuid>,
    ) -> Result<Vec<Contract>, AppError>;

    /// Set the next billing date and increment the cycle counter, provided
    /// the contract still has `expected_next_billing_date`.
    async fn advance_contract(
        &self,
        contract_id: Uuid,
        expected_next_billing_date: Option<NaiveDate>,
        next_billing_date: NaiveDate,
    ) -> Result<Option<Contract>, AppError>;

    // ------------------------------------------------------------------
    // Usage
    // ------------------------------------------------------------------

    /// Append a usage event. An event with a known idempotency key returns
    /// the stored event.
    async fn insert_usage_event(&self, input: &RecordUsage) -> Result<UsageEvent, AppError>;

    /// Sum of quantities with `from <= timestamp < to`.
    async fn sum_usage(
        &self,
        contract_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Decimal, AppError>;

    // ------------------------------------------------------------------
    // Invoices
    // ------------------------------------------------------------------

    async fn find_invoice_for_period(
        &self,
        contract_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Option<Invoice>, AppError>;

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError>;

    async fn get_invoice_lines(&self, invoice_id: Uuid) -> Result<Vec<InvoiceLine>, AppError>;

    async fn list_invoices_for_contract(&self, contract_id: Uuid)
        -> Result<Vec<Invoice>, AppError>;

    /// Atomically increment and return the invoice counter for `year`.
    async fn next_invoice_sequence(&self, year: i32) -> Result<i64, AppError>;

    /// Write header, lines and credit applications in one transaction.
    /// Returns the existing invoice (`created == false`) when the period
    /// was invoiced concurrently.
    async fn commit_invoice(&self, draft: &InvoiceDraft) -> Result<CommittedInvoice, AppError>;

    // ------------------------------------------------------------------
    // Credits
    // ------------------------------------------------------------------

    async fn insert_credit(&self, input: &GrantCredit) -> Result<Credit, AppError>;

    async fn list_credits(&self, customer_id: Uuid) -> Result<Vec<Credit>, AppError>;

    async fn list_unapplied_credits(&self, customer_id: Uuid) -> Result<Vec<Credit>, AppError>;

    async fn find_credits_applied_to(&self, invoice_id: Uuid) -> Result<Vec<Credit>, AppError>;

    /// Mark credits applied and write remainders in one transaction.
    /// Fails with `AppError::Conflict` if any credit was applied meanwhile.
    async fn apply_credit_mutations(
        &self,
        applications: &[CreditApplication],
    ) -> Result<(), AppError>;

    // ------------------------------------------------------------------
    // Entity credit balances
    // ------------------------------------------------------------------

    async fn get_entity_balance(
        &self,
        entity_id: Uuid,
    ) -> Result<Option<EntityCreditBalance>, AppError>;

    /// Increase `total_credits` (creating the balance if needed) and record
    /// the grant as an already-applied ledger credit, in one transaction.
    async fn grant_entity_credits(
        &self,
        entity_id: Uuid,
        credit: &GrantCredit,
    ) -> Result<EntityCreditBalance, AppError>;

    async fn set_user_credit_limit(
        &self,
        entity_id: Uuid,
        limit: Option<Decimal>,
    ) -> Result<Option<EntityCreditBalance>, AppError>;

    /// Single conditional update: add `amount` to `used_credits` only if
    /// `total - used >= amount` and `amount` is within a positive per-user
    /// limit. `None` means the guard refused the deduction.
    async fn consume_entity_credits(
        &self,
        entity_id: Uuid,
        amount: Decimal,
    ) -> Result<Option<EntityCreditBalance>, AppError>;

    // ------------------------------------------------------------------
    // Seat subscriptions
    // ------------------------------------------------------------------

    async fn create_subscription(
        &self,
        input: &CreateEntitySubscription,
        next_billing_date: NaiveDate,
    ) -> Result<EntitySubscription, AppError>;

    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<EntitySubscription>, AppError>;

    async fn update_subscription(
        &self,
        subscription: &EntitySubscription,
    ) -> Result<EntitySubscription, AppError>;

    async fn find_subscriptions_due(
        &self,
        effective_date: NaiveDate,
    ) -> Result<Vec<EntitySubscription>, AppError>;
}
