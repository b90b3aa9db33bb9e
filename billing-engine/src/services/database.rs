//! PostgreSQL implementation of `BillingStore`.

use crate::models::{
    BillingJob, CommittedInvoice, Contract, CreateBillingJob, CreateContract,
    CreateEntitySubscription, Credit, CreditApplication, EntityCreditBalance, EntitySubscription,
    GrantCredit, Invoice, InvoiceDraft, InvoiceLine, JobProgress, JobStatus, RecordUsage,
    UsageEvent,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::BillingStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const JOB_COLUMNS: &str = "job_id, as_of_date, status, trigger_type, target_entity_id, \
    total_customers, processed_customers, skipped_customers, invoices_created, error_message, \
    errors, started_utc, completed_utc, created_utc";

const CONTRACT_COLUMNS: &str = "contract_id, entity_id, name, status, currency, base_fee, \
    overage_fee, discount_rate, min_commit_calls, usage_tiers, start_date, billing_anchor_day, \
    billing_cycle, next_billing_date, created_utc, updated_utc";

const USAGE_COLUMNS: &str =
    "event_id, contract_id, event_type, quantity, \"timestamp\", idempotency_key, created_utc";

const INVOICE_COLUMNS: &str = "invoice_id, invoice_number, contract_id, customer_id, \
    period_start, period_end, billing_cycle, subtotal, discount_amount, credit_amount, total, \
    currency, due_date, status, created_utc";

const LINE_COLUMNS: &str = "line_id, invoice_id, line_type, description, quantity, unit_price, \
    amount, sort_order, created_utc";

const CREDIT_COLUMNS: &str = "credit_id, customer_id, amount, credit_type, description, \
    applied_utc, applied_amount, applied_to_invoice_id, metadata, created_utc";

const BALANCE_COLUMNS: &str =
    "entity_id, total_credits, used_credits, user_credit_limit, updated_utc";

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, entity_id, seat_count, price_per_seat, \
    billing_cycle, current_period_start, next_billing_date, status, canceled_utc, created_utc, \
    updated_utc";

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("Failed to {}: {}", context, e))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-engine"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'_, Postgres>, AppError> {
        self.pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))
    }

    /// Mark credits applied and insert remainders inside `tx`.
    ///
    /// The update is guarded on `applied_utc IS NULL`; a credit consumed by
    /// a concurrent writer aborts the whole transaction.
    async fn write_applications(
        tx: &mut Transaction<'_, Postgres>,
        applications: &[CreditApplication],
        invoice_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        for application in applications {
            let mut applied = application.clone();
            applied.invoice_id = invoice_id.or(application.invoice_id);

            let updated = sqlx::query(
                r#"
                UPDATE credits
                SET applied_utc = NOW(),
                    applied_amount = $2,
                    applied_to_invoice_id = $3,
                    metadata = COALESCE(metadata, '{}'::jsonb) || $4
                WHERE credit_id = $1 AND applied_utc IS NULL
                "#,
            )
            .bind(application.credit_id)
            .bind(application.applied_amount)
            .bind(applied.invoice_id)
            .bind(applied.applied_metadata())
            .execute(&mut **tx)
            .await
            .map_err(|e| db_error("apply credit", e))?;

            if updated.rows_affected() == 0 {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Credit {} was already applied",
                    application.credit_id
                )));
            }

            if !application.fully_consumed() {
                // The remainder keeps the original creation time so FIFO
                // ordering within its type is unchanged.
                sqlx::query(
                    r#"
                    INSERT INTO credits (credit_id, customer_id, amount, credit_type, description, metadata, created_utc)
                    SELECT $1, customer_id, $2, credit_type, description, $3, created_utc
                    FROM credits
                    WHERE credit_id = $4
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(application.remainder)
                .bind(application.remainder_metadata())
                .bind(application.credit_id)
                .execute(&mut **tx)
                .await
                .map_err(|e| db_error("insert credit remainder", e))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BillingStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Billing Job Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self), fields(as_of_date = %as_of_date))]
    async fn find_job_by_date(
        &self,
        as_of_date: NaiveDate,
    ) -> Result<Option<BillingJob>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_job_by_date"])
            .start_timer();

        let job = sqlx::query_as::<_, BillingJob>(&format!(
            "SELECT {} FROM billing_jobs WHERE as_of_date = $1",
            JOB_COLUMNS
        ))
        .bind(as_of_date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find billing job", e))?;

        timer.observe_duration();
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn get_job(&self, job_id: Uuid) -> Result<Option<BillingJob>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_job"])
            .start_timer();

        let job = sqlx::query_as::<_, BillingJob>(&format!(
            "SELECT {} FROM billing_jobs WHERE job_id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get billing job", e))?;

        timer.observe_duration();
        Ok(job)
    }

    #[instrument(skip(self))]
    async fn list_jobs(&self, limit: i64) -> Result<Vec<BillingJob>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_jobs"])
            .start_timer();

        let jobs = sqlx::query_as::<_, BillingJob>(&format!(
            "SELECT {} FROM billing_jobs ORDER BY created_utc DESC, as_of_date DESC LIMIT $1",
            JOB_COLUMNS
        ))
        .bind(limit.clamp(0, 1000))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list billing jobs", e))?;

        timer.observe_duration();
        Ok(jobs)
    }

    #[instrument(skip(self, input), fields(as_of_date = %input.as_of_date, trigger = input.trigger.as_str()))]
    async fn insert_job(&self, input: &CreateBillingJob) -> Result<BillingJob, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_job"])
            .start_timer();

        let job = sqlx::query_as::<_, BillingJob>(&format!(
            r#"
            INSERT INTO billing_jobs (job_id, as_of_date, status, trigger_type, target_entity_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.as_of_date)
        .bind(JobStatus::Pending.as_str())
        .bind(input.trigger.as_str())
        .bind(input.target_entity_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Billing job for {} already exists",
                    input.as_of_date
                ))
            }
            _ => db_error("create billing job", e),
        })?;

        timer.observe_duration();

        info!(job_id = %job.job_id, as_of_date = %job.as_of_date, "Billing job created");

        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn delete_job(&self, job_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_job"])
            .start_timer();

        let result = sqlx::query("DELETE FROM billing_jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("delete billing job", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, from, error_message), fields(job_id = %job_id, to = to.as_str()))]
    async fn transition_job(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        error_message: Option<String>,
    ) -> Result<Option<BillingJob>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["transition_job"])
            .start_timer();

        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();

        let job = sqlx::query_as::<_, BillingJob>(&format!(
            r#"
            UPDATE billing_jobs
            SET status = $2,
                started_utc = CASE WHEN $2 = 'running' THEN NOW() ELSE started_utc END,
                completed_utc = CASE WHEN $3 THEN NOW() ELSE completed_utc END,
                error_message = COALESCE($4, error_message)
            WHERE job_id = $1 AND status = ANY($5)
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(job_id)
        .bind(to.as_str())
        .bind(to.is_terminal())
        .bind(error_message)
        .bind(&from)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("transition billing job", e))?;

        timer.observe_duration();
        Ok(job)
    }

    #[instrument(skip(self, progress), fields(job_id = %job_id))]
    async fn update_job_progress(
        &self,
        job_id: Uuid,
        progress: &JobProgress,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_job_progress"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE billing_jobs
            SET total_customers = $2,
                processed_customers = $3,
                skipped_customers = $4,
                invoices_created = $5,
                errors = $6
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(progress.total_customers)
        .bind(progress.processed_customers)
        .bind(progress.skipped_customers)
        .bind(progress.invoices_created)
        .bind(Json(&progress.errors))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("update job progress", e))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Billing job {} not found",
                job_id
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Contract Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input), fields(entity_id = %input.entity_id))]
    async fn create_contract(&self, input: &CreateContract) -> Result<Contract, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_contract"])
            .start_timer();

        let contract = sqlx::query_as::<_, Contract>(&format!(
            r#"
            INSERT INTO contracts (contract_id, entity_id, name, status, currency, base_fee, overage_fee,
                                   discount_rate, min_commit_calls, usage_tiers, start_date,
                                   billing_anchor_day, next_billing_date)
            VALUES ($1, $2, $3, 'active', $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {}
            "#,
            CONTRACT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.entity_id)
        .bind(&input.name)
        .bind(&input.currency)
        .bind(input.base_fee)
        .bind(input.overage_fee)
        .bind(input.discount_rate)
        .bind(input.min_commit_calls)
        .bind(Json(&input.usage_tiers))
        .bind(input.start_date)
        .bind(input.resolved_anchor_day())
        .bind(input.next_billing_date)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("create contract", e))?;

        timer.observe_duration();

        info!(contract_id = %contract.contract_id, "Contract created");

        Ok(contract)
    }

    #[instrument(skip(self), fields(contract_id = %contract_id))]
    async fn get_contract(&self, contract_id: Uuid) -> Result<Option<Contract>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_contract"])
            .start_timer();

        let contract = sqlx::query_as::<_, Contract>(&format!(
            "SELECT {} FROM contracts WHERE contract_id = $1",
            CONTRACT_COLUMNS
        ))
        .bind(contract_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get contract", e))?;

        timer.observe_duration();
        Ok(contract)
    }

    #[instrument(skip(self), fields(effective_date = %effective_date))]
    async fn find_contracts_due(
        &self,
        effective_date: NaiveDate,
        entity_id: Option<Uuid>,
    ) -> Result<Vec<Contract>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_contracts_due"])
            .start_timer();

        let contracts = sqlx::query_as::<_, Contract>(&format!(
            r#"
            SELECT {}
            FROM contracts
            WHERE status = 'active'
              AND next_billing_date <= $1
              AND ($2::uuid IS NULL OR entity_id = $2)
            ORDER BY next_billing_date ASC, created_utc ASC
            "#,
            CONTRACT_COLUMNS
        ))
        .bind(effective_date)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("find due contracts", e))?;

        timer.observe_duration();
        Ok(contracts)
    }

    #[instrument(skip(self), fields(contract_id = %contract_id, next_billing_date = %next_billing_date))]
    async fn advance_contract(
        &self,
        contract_id: Uuid,
        expected_next_billing_date: Option<NaiveDate>,
        next_billing_date: NaiveDate,
    ) -> Result<Option<Contract>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["advance_contract"])
            .start_timer();

        let contract = sqlx::query_as::<_, Contract>(&format!(
            r#"
            UPDATE contracts
            SET next_billing_date = $3,
                billing_cycle = billing_cycle + 1,
                updated_utc = NOW()
            WHERE contract_id = $1 AND next_billing_date IS NOT DISTINCT FROM $2
            RETURNING {}
            "#,
            CONTRACT_COLUMNS
        ))
        .bind(contract_id)
        .bind(expected_next_billing_date)
        .bind(next_billing_date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("advance contract", e))?;

        timer.observe_duration();
        Ok(contract)
    }

    // -------------------------------------------------------------------------
    // Usage Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input), fields(contract_id = %input.contract_id))]
    async fn insert_usage_event(&self, input: &RecordUsage) -> Result<UsageEvent, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_usage_event"])
            .start_timer();

        let inserted = sqlx::query_as::<_, UsageEvent>(&format!(
            r#"
            INSERT INTO usage_events (event_id, contract_id, event_type, quantity, "timestamp", idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {}
            "#,
            USAGE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.contract_id)
        .bind(input.event_type.as_str())
        .bind(input.quantity)
        .bind(input.timestamp)
        .bind(&input.idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("record usage", e))?;

        let event = match inserted {
            Some(event) => event,
            None => sqlx::query_as::<_, UsageEvent>(&format!(
                "SELECT {} FROM usage_events WHERE idempotency_key = $1",
                USAGE_COLUMNS
            ))
            .bind(&input.idempotency_key)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("fetch existing usage event", e))?,
        };

        timer.observe_duration();
        Ok(event)
    }

    #[instrument(skip(self), fields(contract_id = %contract_id))]
    async fn sum_usage(
        &self,
        contract_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Decimal, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["sum_usage"])
            .start_timer();

        let total = sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT COALESCE(SUM(quantity), 0)
            FROM usage_events
            WHERE contract_id = $1 AND "timestamp" >= $2 AND "timestamp" < $3
            "#,
        )
        .bind(contract_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("aggregate usage", e))?;

        timer.observe_duration();
        Ok(total)
    }

    // -------------------------------------------------------------------------
    // Invoice Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self), fields(contract_id = %contract_id))]
    async fn find_invoice_for_period(
        &self,
        contract_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_invoice_for_period"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            SELECT {}
            FROM invoices
            WHERE contract_id = $1 AND period_start = $2 AND period_end = $3
            "#,
            INVOICE_COLUMNS
        ))
        .bind(contract_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find invoice", e))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE invoice_id = $1",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get invoice", e))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn get_invoice_lines(&self, invoice_id: Uuid) -> Result<Vec<InvoiceLine>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice_lines"])
            .start_timer();

        let lines = sqlx::query_as::<_, InvoiceLine>(&format!(
            "SELECT {} FROM invoice_lines WHERE invoice_id = $1 ORDER BY sort_order",
            LINE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("get invoice lines", e))?;

        timer.observe_duration();
        Ok(lines)
    }

    #[instrument(skip(self), fields(contract_id = %contract_id))]
    async fn list_invoices_for_contract(
        &self,
        contract_id: Uuid,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices_for_contract"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE contract_id = $1 ORDER BY period_start",
            INVOICE_COLUMNS
        ))
        .bind(contract_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list invoices", e))?;

        timer.observe_duration();
        Ok(invoices)
    }

    #[instrument(skip(self))]
    async fn next_invoice_sequence(&self, year: i32) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["next_invoice_sequence"])
            .start_timer();

        let value = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO invoice_sequences (year, last_value)
            VALUES ($1, 1)
            ON CONFLICT (year) DO UPDATE SET last_value = invoice_sequences.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(year)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("allocate invoice number", e))?;

        timer.observe_duration();
        Ok(value)
    }

    #[instrument(skip(self, draft), fields(contract_id = %draft.invoice.contract_id, invoice_number = %draft.invoice.invoice_number))]
    async fn commit_invoice(&self, draft: &InvoiceDraft) -> Result<CommittedInvoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit_invoice"])
            .start_timer();

        let header = &draft.invoice;
        let mut tx = self.begin().await?;

        let inserted = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            INSERT INTO invoices (invoice_id, invoice_number, contract_id, customer_id, period_start,
                                  period_end, billing_cycle, subtotal, discount_amount, credit_amount,
                                  total, currency, due_date, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 'open')
            ON CONFLICT (contract_id, period_start, period_end) DO NOTHING
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&header.invoice_number)
        .bind(header.contract_id)
        .bind(header.customer_id)
        .bind(header.period_start)
        .bind(header.period_end)
        .bind(header.billing_cycle)
        .bind(header.subtotal)
        .bind(header.discount_amount)
        .bind(header.credit_amount)
        .bind(header.total)
        .bind(&header.currency)
        .bind(header.due_date)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("insert invoice", e))?;

        let Some(invoice) = inserted else {
            // Another writer invoiced this period first.
            tx.rollback().await.ok();
            let existing = self
                .find_invoice_for_period(header.contract_id, header.period_start, header.period_end)
                .await?
                .ok_or_else(|| {
                    AppError::Conflict(anyhow::anyhow!(
                        "Invoice for contract {} period {}..{} vanished after conflict",
                        header.contract_id,
                        header.period_start,
                        header.period_end
                    ))
                })?;
            let lines = self.get_invoice_lines(existing.invoice_id).await?;
            timer.observe_duration();
            warn!(invoice_id = %existing.invoice_id, "Invoice already existed for period");
            return Ok(CommittedInvoice {
                invoice: existing,
                lines,
                created: false,
            });
        };

        let mut lines = Vec::with_capacity(draft.lines.len());
        for (i, item) in draft.lines.iter().enumerate() {
            let line = sqlx::query_as::<_, InvoiceLine>(&format!(
                r#"
                INSERT INTO invoice_lines (line_id, invoice_id, line_type, description, quantity, unit_price, amount, sort_order)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING {}
                "#,
                LINE_COLUMNS
            ))
            .bind(Uuid::new_v4())
            .bind(invoice.invoice_id)
            .bind(item.line_type.as_str())
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.amount)
            .bind(i as i32)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| db_error("insert invoice line", e))?;
            lines.push(line);
        }

        Self::write_applications(&mut tx, &draft.credit_applications, Some(invoice.invoice_id))
            .await?;

        tx.commit()
            .await
            .map_err(|e| db_error("commit transaction", e))?;

        timer.observe_duration();

        info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = %invoice.invoice_number,
            line_count = lines.len(),
            "Invoice committed"
        );

        Ok(CommittedInvoice {
            invoice,
            lines,
            created: true,
        })
    }

    // -------------------------------------------------------------------------
    // Credit Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input), fields(customer_id = %input.customer_id))]
    async fn insert_credit(&self, input: &GrantCredit) -> Result<Credit, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_credit"])
            .start_timer();

        let credit = sqlx::query_as::<_, Credit>(&format!(
            r#"
            INSERT INTO credits (credit_id, customer_id, amount, credit_type, description, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            CREDIT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.customer_id)
        .bind(input.amount)
        .bind(input.credit_type.as_str())
        .bind(&input.description)
        .bind(&input.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("insert credit", e))?;

        timer.observe_duration();
        Ok(credit)
    }

    #[instrument(skip(self), fields(customer_id = %customer_id))]
    async fn list_credits(&self, customer_id: Uuid) -> Result<Vec<Credit>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_credits"])
            .start_timer();

        let credits = sqlx::query_as::<_, Credit>(&format!(
            "SELECT {} FROM credits WHERE customer_id = $1 ORDER BY created_utc, credit_id",
            CREDIT_COLUMNS
        ))
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list credits", e))?;

        timer.observe_duration();
        Ok(credits)
    }

    #[instrument(skip(self), fields(customer_id = %customer_id))]
    async fn list_unapplied_credits(&self, customer_id: Uuid) -> Result<Vec<Credit>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_unapplied_credits"])
            .start_timer();

        let credits = sqlx::query_as::<_, Credit>(&format!(
            r#"
            SELECT {}
            FROM credits
            WHERE customer_id = $1 AND applied_utc IS NULL
            ORDER BY created_utc, credit_id
            "#,
            CREDIT_COLUMNS
        ))
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list unapplied credits", e))?;

        timer.observe_duration();
        Ok(credits)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn find_credits_applied_to(&self, invoice_id: Uuid) -> Result<Vec<Credit>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_credits_applied_to"])
            .start_timer();

        let credits = sqlx::query_as::<_, Credit>(&format!(
            "SELECT {} FROM credits WHERE applied_to_invoice_id = $1 ORDER BY created_utc",
            CREDIT_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("find applied credits", e))?;

        timer.observe_duration();
        Ok(credits)
    }

    #[instrument(skip(self, applications), fields(count = applications.len()))]
    async fn apply_credit_mutations(
        &self,
        applications: &[CreditApplication],
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_credit_mutations"])
            .start_timer();

        let mut tx = self.begin().await?;
        Self::write_applications(&mut tx, applications, None).await?;
        tx.commit()
            .await
            .map_err(|e| db_error("commit transaction", e))?;

        timer.observe_duration();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Entity Credit Balance Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self), fields(entity_id = %entity_id))]
    async fn get_entity_balance(
        &self,
        entity_id: Uuid,
    ) -> Result<Option<EntityCreditBalance>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_entity_balance"])
            .start_timer();

        let balance = sqlx::query_as::<_, EntityCreditBalance>(&format!(
            "SELECT {} FROM entity_credit_balances WHERE entity_id = $1",
            BALANCE_COLUMNS
        ))
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get entity balance", e))?;

        timer.observe_duration();
        Ok(balance)
    }

    #[instrument(skip(self, credit), fields(entity_id = %entity_id, amount = %credit.amount))]
    async fn grant_entity_credits(
        &self,
        entity_id: Uuid,
        credit: &GrantCredit,
    ) -> Result<EntityCreditBalance, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["grant_entity_credits"])
            .start_timer();

        let mut tx = self.begin().await?;

        let balance = sqlx::query_as::<_, EntityCreditBalance>(&format!(
            r#"
            INSERT INTO entity_credit_balances (entity_id, total_credits, used_credits)
            VALUES ($1, $2, 0)
            ON CONFLICT (entity_id) DO UPDATE
            SET total_credits = entity_credit_balances.total_credits + EXCLUDED.total_credits,
                updated_utc = NOW()
            RETURNING {}
            "#,
            BALANCE_COLUMNS
        ))
        .bind(entity_id)
        .bind(credit.amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("grant entity credits", e))?;

        sqlx::query(
            r#"
            INSERT INTO credits (credit_id, customer_id, amount, credit_type, description, metadata,
                                 applied_utc, applied_amount)
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), $3)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(credit.customer_id)
        .bind(credit.amount)
        .bind(credit.credit_type.as_str())
        .bind(&credit.description)
        .bind(&credit.metadata)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("record entity credit", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("commit transaction", e))?;

        timer.observe_duration();
        Ok(balance)
    }

    #[instrument(skip(self), fields(entity_id = %entity_id))]
    async fn set_user_credit_limit(
        &self,
        entity_id: Uuid,
        limit: Option<Decimal>,
    ) -> Result<Option<EntityCreditBalance>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_user_credit_limit"])
            .start_timer();

        let balance = sqlx::query_as::<_, EntityCreditBalance>(&format!(
            r#"
            UPDATE entity_credit_balances
            SET user_credit_limit = $2, updated_utc = NOW()
            WHERE entity_id = $1
            RETURNING {}
            "#,
            BALANCE_COLUMNS
        ))
        .bind(entity_id)
        .bind(limit)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("set credit limit", e))?;

        timer.observe_duration();
        Ok(balance)
    }

    #[instrument(skip(self), fields(entity_id = %entity_id, amount = %amount))]
    async fn consume_entity_credits(
        &self,
        entity_id: Uuid,
        amount: Decimal,
    ) -> Result<Option<EntityCreditBalance>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["consume_entity_credits"])
            .start_timer();

        let balance = sqlx::query_as::<_, EntityCreditBalance>(&format!(
            r#"
            UPDATE entity_credit_balances
            SET used_credits = used_credits + $2, updated_utc = NOW()
            WHERE entity_id = $1
              AND total_credits - used_credits >= $2
              AND (user_credit_limit IS NULL OR user_credit_limit <= 0 OR $2 <= user_credit_limit)
            RETURNING {}
            "#,
            BALANCE_COLUMNS
        ))
        .bind(entity_id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("deduct entity credits", e))?;

        timer.observe_duration();
        Ok(balance)
    }

    // -------------------------------------------------------------------------
    // Seat Subscription Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input), fields(entity_id = %input.entity_id))]
    async fn create_subscription(
        &self,
        input: &CreateEntitySubscription,
        next_billing_date: NaiveDate,
    ) -> Result<EntitySubscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, EntitySubscription>(&format!(
            r#"
            INSERT INTO entity_subscriptions (subscription_id, entity_id, seat_count, price_per_seat,
                                              billing_cycle, current_period_start, next_billing_date, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'active')
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.entity_id)
        .bind(input.seat_count)
        .bind(input.price_per_seat)
        .bind(input.billing_cycle.as_str())
        .bind(input.start_date)
        .bind(next_billing_date)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("create subscription", e))?;

        timer.observe_duration();
        Ok(subscription)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<EntitySubscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, EntitySubscription>(&format!(
            "SELECT {} FROM entity_subscriptions WHERE subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get subscription", e))?;

        timer.observe_duration();
        Ok(subscription)
    }

    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id))]
    async fn update_subscription(
        &self,
        subscription: &EntitySubscription,
    ) -> Result<EntitySubscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_subscription"])
            .start_timer();

        let updated = sqlx::query_as::<_, EntitySubscription>(&format!(
            r#"
            UPDATE entity_subscriptions
            SET seat_count = $2,
                price_per_seat = $3,
                billing_cycle = $4,
                current_period_start = $5,
                next_billing_date = $6,
                status = $7,
                canceled_utc = $8,
                updated_utc = NOW()
            WHERE subscription_id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription.subscription_id)
        .bind(subscription.seat_count)
        .bind(subscription.price_per_seat)
        .bind(&subscription.billing_cycle)
        .bind(subscription.current_period_start)
        .bind(subscription.next_billing_date)
        .bind(&subscription.status)
        .bind(subscription.canceled_utc)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("update subscription", e))?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "Subscription {} not found",
                subscription.subscription_id
            ))
        })?;

        timer.observe_duration();
        Ok(updated)
    }

    #[instrument(skip(self), fields(effective_date = %effective_date))]
    async fn find_subscriptions_due(
        &self,
        effective_date: NaiveDate,
    ) -> Result<Vec<EntitySubscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_subscriptions_due"])
            .start_timer();

        let subscriptions = sqlx::query_as::<_, EntitySubscription>(&format!(
            r#"
            SELECT {}
            FROM entity_subscriptions
            WHERE status = 'active' AND next_billing_date <= $1
            ORDER BY next_billing_date ASC
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(effective_date)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("find due subscriptions", e))?;

        timer.observe_duration();
        Ok(subscriptions)
    }
}
