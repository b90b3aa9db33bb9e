//! Billing job orchestrator.
//!
//! One job row per `as_of_date` acts as the lease for that date. The job
//! moves `pending -> running -> completed | failed | cancelled`; contracts
//! are billed one at a time and a failing contract is recorded and skipped
//! rather than aborting the run.

use crate::models::{
    BillingEvent, BillingJob, BillingRunSummary, CommittedInvoice, Contract, CreateBillingJob,
    JobAcquisition, JobProgress, JobStatus, JobTrigger, CANCELLED_REASON, SHUTDOWN_REASON,
};
use crate::pricing::calendar::{billing_period, next_billing_date};
use crate::services::credit_ledger::CreditLedger;
use crate::services::discovery::UsageDiscovery;
use crate::services::events::EventSink;
use crate::services::invoice_generator::{InvoiceGenerator, InvoiceSettings};
use crate::services::metrics;
use crate::services::store::BillingStore;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct BillingOrchestrator {
    store: Arc<dyn BillingStore>,
    events: Arc<dyn EventSink>,
    discovery: UsageDiscovery,
    ledger: CreditLedger,
    generator: InvoiceGenerator,
}

impl BillingOrchestrator {
    pub fn new(
        store: Arc<dyn BillingStore>,
        events: Arc<dyn EventSink>,
        settings: InvoiceSettings,
    ) -> Self {
        let discovery = UsageDiscovery::new(store.clone());
        let ledger = CreditLedger::new(store.clone(), events.clone());
        let generator =
            InvoiceGenerator::new(store.clone(), ledger.clone(), events.clone(), settings);
        Self {
            store,
            events,
            discovery,
            ledger,
            generator,
        }
    }

    pub fn discovery(&self) -> &UsageDiscovery {
        &self.discovery
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn generator(&self) -> &InvoiceGenerator {
        &self.generator
    }

    // -------------------------------------------------------------------------
    // Job queries
    // -------------------------------------------------------------------------

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<BillingJob>, AppError> {
        self.store.get_job(job_id).await
    }

    pub async fn find_job(&self, as_of_date: NaiveDate) -> Result<Option<BillingJob>, AppError> {
        self.store.find_job_by_date(as_of_date).await
    }

    pub async fn list_jobs(&self, limit: i64) -> Result<Vec<BillingJob>, AppError> {
        self.store.list_jobs(limit).await
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Resolve the job for `as_of_date`.
    ///
    /// A completed or in-flight job is returned as-is. A failed or
    /// cancelled job is purged and replaced by a fresh pending job.
    #[instrument(skip(self), fields(as_of_date = %as_of_date, trigger = trigger.as_str()))]
    pub async fn acquire_or_return(
        &self,
        as_of_date: NaiveDate,
        trigger: JobTrigger,
        entity_id: Option<Uuid>,
    ) -> Result<JobAcquisition, AppError> {
        if let Some(existing) = self.store.find_job_by_date(as_of_date).await? {
            match existing.job_status() {
                JobStatus::Completed => return Ok(JobAcquisition::AlreadyCompleted(existing)),
                JobStatus::Pending | JobStatus::Running => {
                    return Ok(JobAcquisition::InProgress(existing))
                }
                JobStatus::Failed | JobStatus::Cancelled => {
                    info!(
                        job_id = %existing.job_id,
                        status = %existing.status,
                        "Purging previous job for retry"
                    );
                    self.store.delete_job(existing.job_id).await?;
                }
            }
        }

        let input = CreateBillingJob {
            as_of_date,
            trigger,
            target_entity_id: entity_id,
        };
        match self.store.insert_job(&input).await {
            Ok(job) => Ok(JobAcquisition::Created(job)),
            Err(AppError::Conflict(_)) => {
                // Another invocation created the job between our read and insert.
                let job = self
                    .store
                    .find_job_by_date(as_of_date)
                    .await?
                    .ok_or_else(|| {
                        AppError::Conflict(anyhow::anyhow!(
                            "Billing job for {} disappeared during acquisition",
                            as_of_date
                        ))
                    })?;
                Ok(match job.job_status() {
                    JobStatus::Completed => JobAcquisition::AlreadyCompleted(job),
                    _ => JobAcquisition::InProgress(job),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Bill every contract due on `as_of_date`.
    ///
    /// Always returns a summary unless the run itself failed, in which case
    /// the job is marked failed and the error is returned. A failed job
    /// releases the date for the next attempt.
    pub async fn run_billing_job(
        &self,
        as_of_date: NaiveDate,
        trigger: JobTrigger,
        entity_id: Option<Uuid>,
    ) -> Result<BillingRunSummary, AppError> {
        self.run_billing_job_until(as_of_date, trigger, entity_id, &CancellationToken::new())
            .await
    }

    /// Same as [`run_billing_job`](Self::run_billing_job), but stops between
    /// contracts once `shutdown` fires and leaves the job cancelled.
    #[instrument(skip(self, shutdown), fields(as_of_date = %as_of_date, trigger = trigger.as_str()))]
    pub async fn run_billing_job_until(
        &self,
        as_of_date: NaiveDate,
        trigger: JobTrigger,
        entity_id: Option<Uuid>,
        shutdown: &CancellationToken,
    ) -> Result<BillingRunSummary, AppError> {
        let started = Instant::now();

        let job = match self.acquire_or_return(as_of_date, trigger, entity_id).await? {
            JobAcquisition::Created(job) => job,
            JobAcquisition::AlreadyCompleted(job) => {
                info!(job_id = %job.job_id, "Billing already completed for date");
                return Ok(BillingRunSummary::from_job(&job, true, None));
            }
            JobAcquisition::InProgress(job) => {
                warn!(job_id = %job.job_id, "Billing job already running");
                return Ok(Self::already_running(&job));
            }
        };

        let started_job = match self
            .store
            .transition_job(job.job_id, &[JobStatus::Pending], JobStatus::Running, None)
            .await
        {
            Ok(started_job) => started_job,
            Err(e) => return Err(self.fail_job(&job, e, started).await),
        };
        let Some(job) = started_job else {
            let current = self.store.get_job(job.job_id).await?.unwrap_or(job);
            warn!(job_id = %current.job_id, "Lost the billing job lease");
            return Ok(Self::already_running(&current));
        };

        info!(job_id = %job.job_id, "Billing job started");
        self.events.publish(BillingEvent::JobStarted {
            job_id: job.job_id,
            as_of_date,
            trigger: trigger.as_str().to_string(),
        });

        let contracts = match self.discovery.find_contracts_due(as_of_date, entity_id).await {
            Ok(contracts) => contracts,
            Err(e) => return Err(self.fail_job(&job, e, started).await),
        };

        let mut progress = JobProgress {
            total_customers: contracts.len() as i32,
            ..JobProgress::default()
        };
        if let Err(e) = self.store.update_job_progress(job.job_id, &progress).await {
            return Err(self.fail_job(&job, e, started).await);
        }

        let mut amount_invoiced = Decimal::ZERO;
        let mut cancelled = false;

        for contract in &contracts {
            if shutdown.is_cancelled() {
                match self.interrupt(&job).await {
                    Ok(()) => {
                        cancelled = true;
                        break;
                    }
                    Err(e) => return Err(self.fail_job(&job, e, started).await),
                }
            }

            match self.store.get_job(job.job_id).await {
                Ok(Some(current)) if current.job_status() == JobStatus::Cancelled => {
                    info!(job_id = %job.job_id, "Billing job cancelled, stopping");
                    cancelled = true;
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(self.fail_job(&job, e, started).await),
            }

            match self.bill_contract(contract, as_of_date).await {
                Ok(committed) => {
                    progress.processed_customers += 1;
                    if committed.created {
                        progress.invoices_created += 1;
                        amount_invoiced += committed.invoice.total;
                    }
                }
                Err(e) => {
                    warn!(
                        contract_id = %contract.contract_id,
                        error = %e,
                        "Contract billing failed, skipping"
                    );
                    metrics::record_contract_failure(e.kind());
                    progress.skipped_customers += 1;
                    progress
                        .errors
                        .push(format!("contract {}: {}", contract.contract_id, e));
                }
            }

            if let Err(e) = self.store.update_job_progress(job.job_id, &progress).await {
                return Err(self.fail_job(&job, e, started).await);
            }
        }

        let finished = if cancelled {
            None
        } else {
            match self
                .store
                .transition_job(job.job_id, &[JobStatus::Running], JobStatus::Completed, None)
                .await
            {
                Ok(done) => done,
                Err(e) => return Err(self.fail_job(&job, e, started).await),
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        let summary = match finished {
            Some(done) => {
                metrics::record_billing_job(trigger.as_str(), JobStatus::Completed.as_str(), elapsed);
                info!(
                    job_id = %done.job_id,
                    invoices_created = progress.invoices_created,
                    skipped = progress.skipped_customers,
                    "Billing job completed"
                );
                self.events.publish(BillingEvent::JobCompleted {
                    job_id: done.job_id,
                    as_of_date,
                    invoices_created: progress.invoices_created,
                    skipped_customers: progress.skipped_customers,
                });
                self.summarize(&done, &progress, amount_invoiced, true, None)
            }
            None => {
                // Cancelled while running; committed invoices stay.
                let current = self.store.get_job(job.job_id).await?.unwrap_or(job);
                metrics::record_billing_job(trigger.as_str(), current.status.as_str(), elapsed);
                let reason = current
                    .error_message
                    .clone()
                    .unwrap_or_else(|| CANCELLED_REASON.to_string());
                self.summarize(&current, &progress, amount_invoiced, false, Some(reason))
            }
        };

        Ok(summary)
    }

    /// Cancel a pending or running job. Finished jobs cannot be cancelled.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<BillingJob, AppError> {
        let job = self.store.get_job(job_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Billing job {} not found", job_id))
        })?;

        if job.job_status().is_terminal() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Billing job {} is already {}",
                job_id,
                job.status
            )));
        }

        let cancelled = self
            .store
            .transition_job(
                job_id,
                &[JobStatus::Pending, JobStatus::Running],
                JobStatus::Cancelled,
                Some(CANCELLED_REASON.to_string()),
            )
            .await?
            .ok_or_else(|| {
                AppError::Conflict(anyhow::anyhow!(
                    "Billing job {} finished before it could be cancelled",
                    job_id
                ))
            })?;

        info!(as_of_date = %cancelled.as_of_date, "Billing job cancelled");
        self.events.publish(BillingEvent::JobCancelled {
            job_id,
            as_of_date: cancelled.as_of_date,
        });
        Ok(cancelled)
    }

    // -------------------------------------------------------------------------
    // Per-contract work
    // -------------------------------------------------------------------------

    #[instrument(skip(self, contract), fields(contract_id = %contract.contract_id))]
    async fn bill_contract(
        &self,
        contract: &Contract,
        as_of_date: NaiveDate,
    ) -> Result<CommittedInvoice, AppError> {
        let period = billing_period(contract.next_billing_date, as_of_date)?;
        if period.used_fallback {
            warn!(
                period_end = %period.end,
                "Contract has no next billing date, using run date as period end"
            );
        }

        let usage = self
            .discovery
            .aggregate_usage(contract.contract_id, period.start, period.end)
            .await?;

        let committed = self
            .generator
            .generate_invoice(contract, usage, period.start, period.end, contract.billing_cycle)
            .await?;

        let next = next_billing_date(as_of_date, contract.anchor_day())?;
        match self
            .store
            .advance_contract(contract.contract_id, contract.next_billing_date, next)
            .await?
        {
            Some(advanced) => info!(
                next_billing_date = %next,
                billing_cycle = advanced.billing_cycle,
                "Contract advanced"
            ),
            None => warn!("Contract was advanced concurrently, leaving it unchanged"),
        }

        Ok(committed)
    }

    async fn interrupt(&self, job: &BillingJob) -> Result<(), AppError> {
        let interrupted = self
            .store
            .transition_job(
                job.job_id,
                &[JobStatus::Running],
                JobStatus::Cancelled,
                Some(SHUTDOWN_REASON.to_string()),
            )
            .await?;
        if interrupted.is_some() {
            warn!(job_id = %job.job_id, "Billing job interrupted by shutdown");
            self.events.publish(BillingEvent::JobCancelled {
                job_id: job.job_id,
                as_of_date: job.as_of_date,
            });
        }
        Ok(())
    }

    async fn fail_job(&self, job: &BillingJob, err: AppError, started: Instant) -> AppError {
        error!(job_id = %job.job_id, error = %err, "Billing job failed");
        if let Err(e) = self
            .store
            .transition_job(
                job.job_id,
                &[JobStatus::Pending, JobStatus::Running],
                JobStatus::Failed,
                Some(err.to_string()),
            )
            .await
        {
            error!(job_id = %job.job_id, error = %e, "Failed to mark billing job failed");
        }
        metrics::record_billing_job(
            job.trigger_type.as_str(),
            JobStatus::Failed.as_str(),
            started.elapsed().as_secs_f64(),
        );
        self.events.publish(BillingEvent::JobFailed {
            job_id: job.job_id,
            as_of_date: job.as_of_date,
            error: err.to_string(),
        });
        err
    }

    fn already_running(job: &BillingJob) -> BillingRunSummary {
        BillingRunSummary::from_job(
            job,
            false,
            Some(format!("Billing job already running for {}", job.as_of_date)),
        )
    }

    fn summarize(
        &self,
        job: &BillingJob,
        progress: &JobProgress,
        amount_invoiced: Decimal,
        success: bool,
        error: Option<String>,
    ) -> BillingRunSummary {
        BillingRunSummary {
            success,
            job_id: job.job_id,
            status: job.job_status(),
            invoices_created: progress.invoices_created,
            total_customers: progress.total_customers,
            processed_customers: progress.processed_customers,
            skipped_customers: progress.skipped_customers,
            amount_invoiced,
            errors: progress.errors.clone(),
            error,
        }
    }
}
