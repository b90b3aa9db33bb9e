//! Credit ledger: ordered application of customer credits to invoices,
//! reversal, and entity-level prepaid balances.

use crate::models::money::round_money;
use crate::models::{
    BillingEvent, Credit, CreditApplication, CreditDeduction, CreditType, DeductionRejection,
    EntityCreditBalance, GrantCredit,
};
use crate::services::events::EventSink;
use crate::services::metrics;
use crate::services::store::BillingStore;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Sort credits into consumption order: type priority, then oldest first.
pub fn sort_for_application(credits: &mut [Credit]) {
    credits.sort_by(|a, b| {
        a.kind()
            .priority()
            .cmp(&b.kind().priority())
            .then(a.created_utc.cmp(&b.created_utc))
    });
}

/// Plan how `credits` cover `amount` without touching storage.
///
/// Applied or non-positive credits are ignored. Each credit contributes
/// `min(credit, remaining)`; a partially consumed credit reports the
/// remainder that must be re-issued.
pub fn plan_application(
    credits: &[Credit],
    amount: Decimal,
    invoice_id: Option<Uuid>,
) -> Vec<CreditApplication> {
    if amount <= Decimal::ZERO {
        return Vec::new();
    }

    let mut candidates: Vec<Credit> = credits
        .iter()
        .filter(|c| !c.is_applied() && c.amount > Decimal::ZERO)
        .cloned()
        .collect();
    sort_for_application(&mut candidates);

    let mut remaining = amount;
    let mut plan = Vec::new();
    for credit in candidates {
        if remaining <= Decimal::ZERO {
            break;
        }
        let applied = credit.amount.min(remaining);
        remaining -= applied;
        plan.push(CreditApplication {
            credit_id: credit.credit_id,
            customer_id: credit.customer_id,
            credit_type: credit.kind(),
            original_amount: credit.amount,
            applied_amount: applied,
            remainder: credit.amount - applied,
            invoice_id,
            original_created_utc: credit.created_utc,
        });
    }
    plan
}

/// Sum of applied amounts in a plan.
pub fn total_applied(plan: &[CreditApplication]) -> Decimal {
    plan.iter().map(|a| a.applied_amount).sum()
}

fn rejection_label(rejection: DeductionRejection) -> &'static str {
    match rejection {
        DeductionRejection::InsufficientCredits => "insufficient_credits",
        DeductionRejection::ExceedsUserLimit => "exceeds_user_limit",
        DeductionRejection::NoBalance => "no_balance",
    }
}

fn integrity_error(balance: &EntityCreditBalance) -> AppError {
    AppError::DataIntegrity(anyhow::anyhow!(
        "Entity {} has used credits {} above total credits {}",
        balance.entity_id,
        balance.used_credits,
        balance.total_credits
    ))
}

#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn BillingStore>,
    events: Arc<dyn EventSink>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn BillingStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    // ------------------------------------------------------------------
    // Customer credits
    // ------------------------------------------------------------------

    #[instrument(skip(self, description), fields(customer_id = %customer_id, amount = %amount, credit_type = credit_type.as_str()))]
    pub async fn grant_credit(
        &self,
        customer_id: Uuid,
        amount: Decimal,
        credit_type: CreditType,
        description: &str,
    ) -> Result<Credit, AppError> {
        if amount <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Credit amount must be positive (got {})",
                amount
            )));
        }

        let credit = self
            .store
            .insert_credit(&GrantCredit {
                customer_id,
                amount: round_money(amount),
                credit_type,
                description: description.to_string(),
                metadata: None,
            })
            .await?;

        info!(credit_id = %credit.credit_id, "Credit granted");
        Ok(credit)
    }

    /// Sum of every unapplied credit held by the customer.
    pub async fn available_credit(&self, customer_id: Uuid) -> Result<Decimal, AppError> {
        Ok(self
            .store
            .list_unapplied_credits(customer_id)
            .await?
            .iter()
            .map(|c| c.amount)
            .sum())
    }

    /// Plan against the customer's current unapplied credits.
    pub async fn plan_for(
        &self,
        customer_id: Uuid,
        amount: Decimal,
        invoice_id: Option<Uuid>,
    ) -> Result<Vec<CreditApplication>, AppError> {
        let credits = self.store.list_unapplied_credits(customer_id).await?;
        Ok(plan_application(&credits, amount, invoice_id))
    }

    /// Consume credits against an existing invoice total and persist the
    /// mutations atomically.
    #[instrument(skip(self), fields(customer_id = %customer_id, invoice_id = %invoice_id))]
    pub async fn apply_to_invoice(
        &self,
        customer_id: Uuid,
        invoice_id: Uuid,
        invoice_total: Decimal,
    ) -> Result<Vec<CreditApplication>, AppError> {
        let plan = self
            .plan_for(customer_id, invoice_total, Some(invoice_id))
            .await?;
        if plan.is_empty() {
            return Ok(plan);
        }

        self.store.apply_credit_mutations(&plan).await?;
        self.record_applied(customer_id, Some(invoice_id), &plan);
        Ok(plan)
    }

    /// Metrics and event for credits that were committed.
    pub fn record_applied(
        &self,
        customer_id: Uuid,
        invoice_id: Option<Uuid>,
        plan: &[CreditApplication],
    ) {
        for application in plan {
            metrics::record_credit_applied(
                application.credit_type.as_str(),
                application.applied_amount,
            );
        }
        let amount = total_applied(plan);
        info!(
            customer_id = %customer_id,
            credits = plan.len(),
            amount = %amount,
            "Credits applied"
        );
        self.events.publish(BillingEvent::CreditsApplied {
            customer_id,
            invoice_id,
            amount,
        });
    }

    /// Issue adjustment credits equal to what each credit contributed to
    /// `invoice_id`. Credits already reversed are skipped, so repeating the
    /// call issues nothing new.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn reverse_invoice_credits(&self, invoice_id: Uuid) -> Result<Vec<Credit>, AppError> {
        let applied = self.store.find_credits_applied_to(invoice_id).await?;

        let mut reversed_ids: HashSet<Uuid> = HashSet::new();
        let customers: HashSet<Uuid> = applied.iter().map(|c| c.customer_id).collect();
        for customer_id in customers {
            reversed_ids.extend(
                self.store
                    .list_credits(customer_id)
                    .await?
                    .iter()
                    .filter_map(Credit::reversal_of),
            );
        }

        let mut issued = Vec::new();
        for credit in applied {
            if reversed_ids.contains(&credit.credit_id) {
                continue;
            }
            let amount = credit.applied_amount.unwrap_or(credit.amount);
            if amount <= Decimal::ZERO {
                continue;
            }
            let reversal = self
                .store
                .insert_credit(&GrantCredit {
                    customer_id: credit.customer_id,
                    amount,
                    credit_type: CreditType::Adjustment,
                    description: format!("Reversal of credit applied to invoice {}", invoice_id),
                    metadata: Some(serde_json::json!({
                        "reversal_of": credit.credit_id.to_string(),
                        "invoice_id": invoice_id.to_string(),
                    })),
                })
                .await?;
            issued.push(reversal);
        }

        if !issued.is_empty() {
            let amount: Decimal = issued.iter().map(|c| c.amount).sum();
            info!(credits_issued = issued.len(), amount = %amount, "Invoice credits reversed");
            self.events.publish(BillingEvent::CreditsReversed {
                invoice_id,
                amount,
                credits_issued: issued.len(),
            });
        }
        Ok(issued)
    }

    // ------------------------------------------------------------------
    // Entity balances
    // ------------------------------------------------------------------

    /// Current balance, rejecting a stored balance that breaks
    /// `used <= total`.
    pub async fn entity_balance(
        &self,
        entity_id: Uuid,
    ) -> Result<Option<EntityCreditBalance>, AppError> {
        match self.store.get_entity_balance(entity_id).await? {
            Some(balance) if !balance.is_consistent() => Err(integrity_error(&balance)),
            other => Ok(other),
        }
    }

    #[instrument(skip(self, description), fields(entity_id = %entity_id, amount = %amount))]
    pub async fn grant_entity_credits(
        &self,
        entity_id: Uuid,
        amount: Decimal,
        description: &str,
    ) -> Result<EntityCreditBalance, AppError> {
        if amount <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Credit amount must be positive (got {})",
                amount
            )));
        }

        let balance = self
            .store
            .grant_entity_credits(
                entity_id,
                &GrantCredit {
                    customer_id: entity_id,
                    amount: round_money(amount),
                    credit_type: CreditType::Manual,
                    description: description.to_string(),
                    metadata: Some(serde_json::json!({ "entity_balance": true })),
                },
            )
            .await?;

        info!(total_credits = %balance.total_credits, "Entity credits granted");
        Ok(balance)
    }

    /// Set or clear the per-deduction limit. Zero or negative disables it.
    #[instrument(skip(self), fields(entity_id = %entity_id))]
    pub async fn set_user_credit_limit(
        &self,
        entity_id: Uuid,
        limit: Option<Decimal>,
    ) -> Result<EntityCreditBalance, AppError> {
        self.store
            .set_user_credit_limit(entity_id, limit)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "No credit balance found for entity {}",
                    entity_id
                ))
            })
    }

    /// Deduct from an entity's prepaid balance.
    ///
    /// Business refusals come back as `CreditDeduction::Rejected`; only
    /// invalid input, storage failures and corrupt balances are errors.
    #[instrument(skip(self), fields(entity_id = %entity_id, amount = %amount))]
    pub async fn deduct_entity_credits(
        &self,
        entity_id: Uuid,
        amount: Decimal,
    ) -> Result<CreditDeduction, AppError> {
        if amount <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Deduction amount must be positive (got {})",
                amount
            )));
        }

        if let Some(balance) = self.store.consume_entity_credits(entity_id, amount).await? {
            if !balance.is_consistent() {
                return Err(integrity_error(&balance));
            }
            metrics::record_entity_deduction("deducted");
            info!(remaining = %balance.available(), "Entity credits deducted");
            self.events.publish(BillingEvent::EntityCreditsDeducted {
                entity_id,
                amount,
                remaining: balance.available(),
            });
            return Ok(CreditDeduction::Deducted(balance));
        }

        let rejection = match self.store.get_entity_balance(entity_id).await? {
            None => DeductionRejection::NoBalance,
            Some(balance) if !balance.is_consistent() => return Err(integrity_error(&balance)),
            Some(balance) => match balance.effective_limit() {
                _ if balance.available() < amount => DeductionRejection::InsufficientCredits,
                Some(limit) if amount > limit => DeductionRejection::ExceedsUserLimit,
                // The balance moved between the guarded update and this read.
                _ => DeductionRejection::InsufficientCredits,
            },
        };

        metrics::record_entity_deduction(rejection_label(rejection));
        warn!(reason = rejection.reason(), "Entity credit deduction rejected");
        Ok(CreditDeduction::Rejected(rejection))
    }
}
