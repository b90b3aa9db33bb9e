//! In-process `BillingStore` used by tests and local runs.
//!
//! All state sits behind one async mutex, so every compound operation is
//! atomic. Failures can be injected per operation name or per contract.

use crate::models::{
    BillingJob, CommittedInvoice, Contract, ContractStatus, CreateBillingJob, CreateContract,
    CreateEntitySubscription, Credit, CreditApplication, EntityCreditBalance, EntitySubscription,
    GrantCredit, Invoice, InvoiceDraft, InvoiceLine, InvoiceStatus, JobProgress, JobStatus,
    RecordUsage, SubscriptionStatus, UsageEvent, CANCELLED_REASON,
};
use crate::services::store::BillingStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, BillingJob>,
    contracts: HashMap<Uuid, Contract>,
    usage: Vec<UsageEvent>,
    invoices: HashMap<Uuid, Invoice>,
    invoice_lines: HashMap<Uuid, Vec<InvoiceLine>>,
    sequences: HashMap<i32, i64>,
    // Insertion order breaks ties between equal creation times.
    credits: Vec<Credit>,
    balances: HashMap<Uuid, EntityCreditBalance>,
    subscriptions: HashMap<Uuid, EntitySubscription>,
    failing_operations: HashSet<String>,
    failing_contracts: HashSet<Uuid>,
    failing_transitions: HashSet<&'static str>,
    cancel_after_invoices: Option<usize>,
}

impl State {
    fn check(&self, operation: &str) -> Result<(), AppError> {
        if self.failing_operations.contains(operation) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "Injected failure in {}",
                operation
            )));
        }
        Ok(())
    }

    fn check_contract(&self, contract_id: Uuid) -> Result<(), AppError> {
        if self.failing_contracts.contains(&contract_id) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "Injected failure for contract {}",
                contract_id
            )));
        }
        Ok(())
    }

    fn credit_mut(&mut self, credit_id: Uuid) -> Option<&mut Credit> {
        self.credits.iter_mut().find(|c| c.credit_id == credit_id)
    }

    /// Verify every credit is still unapplied before mutating any of them.
    fn check_applications(&self, applications: &[CreditApplication]) -> Result<(), AppError> {
        for application in applications {
            let credit = self
                .credits
                .iter()
                .find(|c| c.credit_id == application.credit_id)
                .ok_or_else(|| {
                    AppError::NotFound(anyhow::anyhow!(
                        "Credit {} not found",
                        application.credit_id
                    ))
                })?;
            if credit.is_applied() {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Credit {} was already applied",
                    application.credit_id
                )));
            }
        }
        Ok(())
    }

    fn write_applications(&mut self, applications: &[CreditApplication], invoice_id: Option<Uuid>) {
        let now = Utc::now();
        for application in applications {
            let invoice_id = invoice_id.or(application.invoice_id);
            let mut applied = application.clone();
            applied.invoice_id = invoice_id;

            if let Some(credit) = self.credit_mut(application.credit_id) {
                credit.applied_utc = Some(now);
                credit.applied_amount = Some(application.applied_amount);
                credit.applied_to_invoice_id = invoice_id;
                credit.metadata = Some(merge_metadata(
                    credit.metadata.take(),
                    applied.applied_metadata(),
                ));
            }

            if !application.fully_consumed() {
                let description = self
                    .credits
                    .iter()
                    .find(|c| c.credit_id == application.credit_id)
                    .map(|c| c.description.clone())
                    .unwrap_or_default();
                self.credits.push(Credit {
                    credit_id: Uuid::new_v4(),
                    customer_id: application.customer_id,
                    amount: application.remainder,
                    credit_type: application.credit_type.as_str().to_string(),
                    description,
                    applied_utc: None,
                    applied_amount: None,
                    applied_to_invoice_id: None,
                    metadata: Some(application.remainder_metadata()),
                    created_utc: application.original_created_utc,
                });
            }
        }
    }

    fn new_credit(input: &GrantCredit) -> Credit {
        Credit {
            credit_id: Uuid::new_v4(),
            customer_id: input.customer_id,
            amount: input.amount,
            credit_type: input.credit_type.as_str().to_string(),
            description: input.description.clone(),
            applied_utc: None,
            applied_amount: None,
            applied_to_invoice_id: None,
            metadata: input.metadata.clone(),
            created_utc: Utc::now(),
        }
    }
}

fn merge_metadata(
    existing: Option<serde_json::Value>,
    update: serde_json::Value,
) -> serde_json::Value {
    match (existing, update) {
        (Some(serde_json::Value::Object(mut base)), serde_json::Value::Object(extra)) => {
            base.extend(extra);
            serde_json::Value::Object(base)
        }
        (_, update) => update,
    }
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call to `operation` fail with a database error.
    pub async fn inject_failure(&self, operation: &str) {
        self.state
            .lock()
            .await
            .failing_operations
            .insert(operation.to_string());
    }

    pub async fn clear_failure(&self, operation: &str) {
        self.state.lock().await.failing_operations.remove(operation);
    }

    /// Make job transitions into `to` fail; other transitions still succeed.
    pub async fn inject_transition_failure(&self, to: JobStatus) {
        self.state
            .lock()
            .await
            .failing_transitions
            .insert(to.as_str());
    }

    pub async fn clear_transition_failure(&self, to: JobStatus) {
        self.state
            .lock()
            .await
            .failing_transitions
            .remove(to.as_str());
    }

    /// Make usage aggregation for one contract fail.
    pub async fn inject_contract_failure(&self, contract_id: Uuid) {
        self.state.lock().await.failing_contracts.insert(contract_id);
    }

    pub async fn clear_contract_failure(&self, contract_id: Uuid) {
        self.state.lock().await.failing_contracts.remove(&contract_id);
    }

    /// Cancel every running job once `count` more invoices are committed,
    /// as if a user cancelled mid-run.
    pub async fn cancel_running_jobs_after_invoices(&self, count: usize) {
        self.state.lock().await.cancel_after_invoices = Some(count);
    }

    /// Overwrite a balance directly, bypassing the ledger.
    pub async fn put_entity_balance(&self, balance: EntityCreditBalance) {
        self.state
            .lock()
            .await
            .balances
            .insert(balance.entity_id, balance);
    }

    /// Force a job into a status without the transition guard.
    pub async fn force_job_status(&self, job_id: Uuid, status: JobStatus) {
        if let Some(job) = self.state.lock().await.jobs.get_mut(&job_id) {
            job.status = status.as_str().to_string();
        }
    }

    pub async fn invoice_count(&self) -> usize {
        self.state.lock().await.invoices.len()
    }

    /// Last invoice sequence issued for `year`, if any.
    pub async fn invoice_sequence(&self, year: i32) -> Option<i64> {
        self.state.lock().await.sequences.get(&year).copied()
    }

    pub async fn line_count(&self) -> usize {
        self.state
            .lock()
            .await
            .invoice_lines
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        self.state.lock().await.check("health_check")
    }

    // ------------------------------------------------------------------
    // Billing jobs
    // ------------------------------------------------------------------

    async fn find_job_by_date(
        &self,
        as_of_date: NaiveDate,
    ) -> Result<Option<BillingJob>, AppError> {
        let state = self.state.lock().await;
        state.check("find_job_by_date")?;
        Ok(state
            .jobs
            .values()
            .find(|j| j.as_of_date == as_of_date)
            .cloned())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<BillingJob>, AppError> {
        let state = self.state.lock().await;
        state.check("get_job")?;
        Ok(state.jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<BillingJob>, AppError> {
        let state = self.state.lock().await;
        state.check("list_jobs")?;
        let mut jobs: Vec<BillingJob> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| {
            b.created_utc
                .cmp(&a.created_utc)
                .then(b.as_of_date.cmp(&a.as_of_date))
        });
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn insert_job(&self, input: &CreateBillingJob) -> Result<BillingJob, AppError> {
        let mut state = self.state.lock().await;
        state.check("insert_job")?;
        if state.jobs.values().any(|j| j.as_of_date == input.as_of_date) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Billing job for {} already exists",
                input.as_of_date
            )));
        }
        let job = BillingJob {
            job_id: Uuid::new_v4(),
            as_of_date: input.as_of_date,
            status: JobStatus::Pending.as_str().to_string(),
            trigger_type: input.trigger.as_str().to_string(),
            target_entity_id: input.target_entity_id,
            total_customers: 0,
            processed_customers: 0,
            skipped_customers: 0,
            invoices_created: 0,
            error_message: None,
            errors: Vec::new(),
            started_utc: None,
            completed_utc: None,
            created_utc: Utc::now(),
        };
        state.jobs.insert(job.job_id, job.clone());
        Ok(job)
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        state.check("delete_job")?;
        Ok(state.jobs.remove(&job_id).is_some())
    }

    async fn transition_job(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        error_message: Option<String>,
    ) -> Result<Option<BillingJob>, AppError> {
        let mut state = self.state.lock().await;
        state.check("transition_job")?;
        if state.failing_transitions.contains(to.as_str()) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "Injected failure moving job to {}",
                to.as_str()
            )));
        }
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if !from.contains(&job.job_status()) {
            return Ok(None);
        }
        let now = Utc::now();
        job.status = to.as_str().to_string();
        if to == JobStatus::Running {
            job.started_utc = Some(now);
        }
        if to.is_terminal() {
            job.completed_utc = Some(now);
        }
        if error_message.is_some() {
            job.error_message = error_message;
        }
        Ok(Some(job.clone()))
    }

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        progress: &JobProgress,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        state.check("update_job_progress")?;
        let job = state.jobs.get_mut(&job_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Billing job {} not found", job_id))
        })?;
        job.total_customers = progress.total_customers;
        job.processed_customers = progress.processed_customers;
        job.skipped_customers = progress.skipped_customers;
        job.invoices_created = progress.invoices_created;
        job.errors = progress.errors.clone();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Contracts
    // ------------------------------------------------------------------

    async fn create_contract(&self, input: &CreateContract) -> Result<Contract, AppError> {
        let mut state = self.state.lock().await;
        state.check("create_contract")?;
        let now = Utc::now();
        let contract = Contract {
            contract_id: Uuid::new_v4(),
            entity_id: input.entity_id,
            name: input.name.clone(),
            status: ContractStatus::Active.as_str().to_string(),
            currency: input.currency.clone(),
            base_fee: input.base_fee,
            overage_fee: input.overage_fee,
            discount_rate: input.discount_rate,
            min_commit_calls: input.min_commit_calls,
            usage_tiers: input.usage_tiers.clone(),
            start_date: input.start_date,
            billing_anchor_day: Some(input.resolved_anchor_day()),
            billing_cycle: 1,
            next_billing_date: input.next_billing_date,
            created_utc: now,
            updated_utc: now,
        };
        state.contracts.insert(contract.contract_id, contract.clone());
        Ok(contract)
    }

    async fn get_contract(&self, contract_id: Uuid) -> Result<Option<Contract>, AppError> {
        let state = self.state.lock().await;
        state.check("get_contract")?;
        Ok(state.contracts.get(&contract_id).cloned())
    }

    async fn find_contracts_due(
        &self,
        effective_date: NaiveDate,
        entity_id: Option<Uuid>,
    ) -> Result<Vec<Contract>, AppError> {
        let state = self.state.lock().await;
        state.check("find_contracts_due")?;
        let mut due: Vec<Contract> = state
            .contracts
            .values()
            .filter(|c| c.contract_status() == ContractStatus::Active)
            .filter(|c| c.next_billing_date.is_some_and(|d| d <= effective_date))
            .filter(|c| entity_id.is_none_or(|e| c.entity_id == e))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_billing_date
                .cmp(&b.next_billing_date)
                .then(a.created_utc.cmp(&b.created_utc))
        });
        Ok(due)
    }

    async fn advance_contract(
        &self,
        contract_id: Uuid,
        expected_next_billing_date: Option<NaiveDate>,
        next_billing_date: NaiveDate,
    ) -> Result<Option<Contract>, AppError> {
        let mut state = self.state.lock().await;
        state.check("advance_contract")?;
        let Some(contract) = state.contracts.get_mut(&contract_id) else {
            return Ok(None);
        };
        if contract.next_billing_date != expected_next_billing_date {
            return Ok(None);
        }
        contract.next_billing_date = Some(next_billing_date);
        contract.billing_cycle += 1;
        contract.updated_utc = Utc::now();
        Ok(Some(contract.clone()))
    }

    // ------------------------------------------------------------------
    // Usage
    // ------------------------------------------------------------------

    async fn insert_usage_event(&self, input: &RecordUsage) -> Result<UsageEvent, AppError> {
        let mut state = self.state.lock().await;
        state.check("insert_usage_event")?;
        if let Some(key) = &input.idempotency_key {
            if let Some(existing) = state
                .usage
                .iter()
                .find(|e| e.idempotency_key.as_ref() == Some(key))
            {
                return Ok(existing.clone());
            }
        }
        let event = UsageEvent {
            event_id: Uuid::new_v4(),
            contract_id: input.contract_id,
            event_type: input.event_type.as_str().to_string(),
            quantity: input.quantity,
            timestamp: input.timestamp,
            idempotency_key: input.idempotency_key.clone(),
            created_utc: Utc::now(),
        };
        state.usage.push(event.clone());
        Ok(event)
    }

    async fn sum_usage(
        &self,
        contract_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Decimal, AppError> {
        let state = self.state.lock().await;
        state.check("sum_usage")?;
        state.check_contract(contract_id)?;
        Ok(state
            .usage
            .iter()
            .filter(|e| e.contract_id == contract_id && e.timestamp >= from && e.timestamp < to)
            .map(|e| e.quantity)
            .sum())
    }

    // ------------------------------------------------------------------
    // Invoices
    // ------------------------------------------------------------------

    async fn find_invoice_for_period(
        &self,
        contract_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Option<Invoice>, AppError> {
        let state = self.state.lock().await;
        state.check("find_invoice_for_period")?;
        Ok(state
            .invoices
            .values()
            .find(|i| {
                i.contract_id == contract_id
                    && i.period_start == period_start
                    && i.period_end == period_end
            })
            .cloned())
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let state = self.state.lock().await;
        state.check("get_invoice")?;
        Ok(state.invoices.get(&invoice_id).cloned())
    }

    async fn get_invoice_lines(&self, invoice_id: Uuid) -> Result<Vec<InvoiceLine>, AppError> {
        let state = self.state.lock().await;
        state.check("get_invoice_lines")?;
        Ok(state
            .invoice_lines
            .get(&invoice_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_invoices_for_contract(
        &self,
        contract_id: Uuid,
    ) -> Result<Vec<Invoice>, AppError> {
        let state = self.state.lock().await;
        state.check("list_invoices_for_contract")?;
        let mut invoices: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|i| i.contract_id == contract_id)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.period_start);
        Ok(invoices)
    }

    async fn next_invoice_sequence(&self, year: i32) -> Result<i64, AppError> {
        let mut state = self.state.lock().await;
        state.check("next_invoice_sequence")?;
        let counter = state.sequences.entry(year).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn commit_invoice(&self, draft: &InvoiceDraft) -> Result<CommittedInvoice, AppError> {
        let mut state = self.state.lock().await;
        state.check("commit_invoice")?;

        let header = &draft.invoice;
        if let Some(existing) = state
            .invoices
            .values()
            .find(|i| {
                i.contract_id == header.contract_id
                    && i.period_start == header.period_start
                    && i.period_end == header.period_end
            })
            .cloned()
        {
            let lines = state
                .invoice_lines
                .get(&existing.invoice_id)
                .cloned()
                .unwrap_or_default();
            return Ok(CommittedInvoice {
                invoice: existing,
                lines,
                created: false,
            });
        }

        state.check_applications(&draft.credit_applications)?;

        let now = Utc::now();
        let invoice = Invoice {
            invoice_id: Uuid::new_v4(),
            invoice_number: header.invoice_number.clone(),
            contract_id: header.contract_id,
            customer_id: header.customer_id,
            period_start: header.period_start,
            period_end: header.period_end,
            billing_cycle: header.billing_cycle,
            subtotal: header.subtotal,
            discount_amount: header.discount_amount,
            credit_amount: header.credit_amount,
            total: header.total,
            currency: header.currency.clone(),
            due_date: header.due_date,
            status: InvoiceStatus::Open.as_str().to_string(),
            created_utc: now,
        };
        let lines: Vec<InvoiceLine> = draft
            .lines
            .iter()
            .enumerate()
            .map(|(i, item)| InvoiceLine {
                line_id: Uuid::new_v4(),
                invoice_id: invoice.invoice_id,
                line_type: item.line_type.as_str().to_string(),
                description: item.description.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
                amount: item.amount,
                sort_order: i as i32,
                created_utc: now,
            })
            .collect();

        state.write_applications(&draft.credit_applications, Some(invoice.invoice_id));
        state.invoices.insert(invoice.invoice_id, invoice.clone());
        state.invoice_lines.insert(invoice.invoice_id, lines.clone());

        if let Some(remaining) = state.cancel_after_invoices.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                state.cancel_after_invoices = None;
                for job in state.jobs.values_mut() {
                    if job.job_status() == JobStatus::Running {
                        job.status = JobStatus::Cancelled.as_str().to_string();
                        job.error_message = Some(CANCELLED_REASON.to_string());
                        job.completed_utc = Some(now);
                    }
                }
            }
        }

        Ok(CommittedInvoice {
            invoice,
            lines,
            created: true,
        })
    }

    // ------------------------------------------------------------------
    // Credits
    // ------------------------------------------------------------------

    async fn insert_credit(&self, input: &GrantCredit) -> Result<Credit, AppError> {
        let mut state = self.state.lock().await;
        state.check("insert_credit")?;
        let credit = State::new_credit(input);
        state.credits.push(credit.clone());
        Ok(credit)
    }

    async fn list_credits(&self, customer_id: Uuid) -> Result<Vec<Credit>, AppError> {
        let state = self.state.lock().await;
        state.check("list_credits")?;
        let mut credits: Vec<Credit> = state
            .credits
            .iter()
            .filter(|c| c.customer_id == customer_id)
            .cloned()
            .collect();
        credits.sort_by_key(|c| c.created_utc);
        Ok(credits)
    }

    async fn list_unapplied_credits(&self, customer_id: Uuid) -> Result<Vec<Credit>, AppError> {
        let state = self.state.lock().await;
        state.check("list_unapplied_credits")?;
        let mut credits: Vec<Credit> = state
            .credits
            .iter()
            .filter(|c| c.customer_id == customer_id && !c.is_applied())
            .cloned()
            .collect();
        credits.sort_by_key(|c| c.created_utc);
        Ok(credits)
    }

    async fn find_credits_applied_to(&self, invoice_id: Uuid) -> Result<Vec<Credit>, AppError> {
        let state = self.state.lock().await;
        state.check("find_credits_applied_to")?;
        Ok(state
            .credits
            .iter()
            .filter(|c| c.applied_to_invoice_id == Some(invoice_id))
            .cloned()
            .collect())
    }

    async fn apply_credit_mutations(
        &self,
        applications: &[CreditApplication],
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        state.check("apply_credit_mutations")?;
        state.check_applications(applications)?;
        state.write_applications(applications, None);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entity credit balances
    // ------------------------------------------------------------------

    async fn get_entity_balance(
        &self,
        entity_id: Uuid,
    ) -> Result<Option<EntityCreditBalance>, AppError> {
        let state = self.state.lock().await;
        state.check("get_entity_balance")?;
        Ok(state.balances.get(&entity_id).cloned())
    }

    async fn grant_entity_credits(
        &self,
        entity_id: Uuid,
        credit: &GrantCredit,
    ) -> Result<EntityCreditBalance, AppError> {
        let mut state = self.state.lock().await;
        state.check("grant_entity_credits")?;
        let now = Utc::now();
        let balance = state
            .balances
            .entry(entity_id)
            .or_insert_with(|| EntityCreditBalance {
                entity_id,
                total_credits: Decimal::ZERO,
                used_credits: Decimal::ZERO,
                user_credit_limit: None,
                updated_utc: now,
            });
        balance.total_credits += credit.amount;
        balance.updated_utc = now;
        let balance = balance.clone();
        // The grant is consumed into the balance, so it never offsets invoices.
        let mut record = State::new_credit(credit);
        record.applied_utc = Some(now);
        record.applied_amount = Some(credit.amount);
        state.credits.push(record);
        Ok(balance)
    }

    async fn set_user_credit_limit(
        &self,
        entity_id: Uuid,
        limit: Option<Decimal>,
    ) -> Result<Option<EntityCreditBalance>, AppError> {
        let mut state = self.state.lock().await;
        state.check("set_user_credit_limit")?;
        Ok(state.balances.get_mut(&entity_id).map(|balance| {
            balance.user_credit_limit = limit;
            balance.updated_utc = Utc::now();
            balance.clone()
        }))
    }

    async fn consume_entity_credits(
        &self,
        entity_id: Uuid,
        amount: Decimal,
    ) -> Result<Option<EntityCreditBalance>, AppError> {
        let mut state = self.state.lock().await;
        state.check("consume_entity_credits")?;
        let Some(balance) = state.balances.get_mut(&entity_id) else {
            return Ok(None);
        };
        let within_limit = balance.effective_limit().is_none_or(|limit| amount <= limit);
        if balance.available() < amount || !within_limit {
            return Ok(None);
        }
        balance.used_credits += amount;
        balance.updated_utc = Utc::now();
        Ok(Some(balance.clone()))
    }

    // ------------------------------------------------------------------
    // Seat subscriptions
    // ------------------------------------------------------------------

    async fn create_subscription(
        &self,
        input: &CreateEntitySubscription,
        next_billing_date: NaiveDate,
    ) -> Result<EntitySubscription, AppError> {
        let mut state = self.state.lock().await;
        state.check("create_subscription")?;
        let now = Utc::now();
        let subscription = EntitySubscription {
            subscription_id: Uuid::new_v4(),
            entity_id: input.entity_id,
            seat_count: input.seat_count,
            price_per_seat: input.price_per_seat,
            billing_cycle: input.billing_cycle.as_str().to_string(),
            current_period_start: input.start_date,
            next_billing_date,
            status: SubscriptionStatus::Active.as_str().to_string(),
            canceled_utc: None,
            created_utc: now,
            updated_utc: now,
        };
        state
            .subscriptions
            .insert(subscription.subscription_id, subscription.clone());
        Ok(subscription)
    }

    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<EntitySubscription>, AppError> {
        let state = self.state.lock().await;
        state.check("get_subscription")?;
        Ok(state.subscriptions.get(&subscription_id).cloned())
    }

    async fn update_subscription(
        &self,
        subscription: &EntitySubscription,
    ) -> Result<EntitySubscription, AppError> {
        let mut state = self.state.lock().await;
        state.check("update_subscription")?;
        let stored = state
            .subscriptions
            .get_mut(&subscription.subscription_id)
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Subscription {} not found",
                    subscription.subscription_id
                ))
            })?;
        *stored = subscription.clone();
        stored.updated_utc = Utc::now();
        Ok(stored.clone())
    }

    async fn find_subscriptions_due(
        &self,
        effective_date: NaiveDate,
    ) -> Result<Vec<EntitySubscription>, AppError> {
        let state = self.state.lock().await;
        state.check("find_subscriptions_due")?;
        let mut due: Vec<EntitySubscription> = state
            .subscriptions
            .values()
            .filter(|s| {
                s.subscription_status() == SubscriptionStatus::Active
                    && s.next_billing_date <= effective_date
            })
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_billing_date);
        Ok(due)
    }
}
