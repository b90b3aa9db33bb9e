//! Invoice generation for pay-as-you-go contracts.

use crate::models::money::round_money;
use crate::models::{
    format_invoice_number, BillingEvent, CommittedInvoice, Contract, Credit, InvoiceAmounts,
    InvoiceDraft, LineItem, LineType, NewInvoice,
};
use crate::pricing::calendar::days_between_inclusive;
use crate::pricing::proration::daily_proration;
use crate::pricing::tiered::tiered_usage_cost;
use crate::pricing::PricingError;
use crate::services::credit_ledger::{plan_application, total_applied, CreditLedger};
use crate::services::events::EventSink;
use crate::services::metrics;
use crate::services::store::BillingStore;
use chrono::{Datelike, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Introductory discounts apply to the first this-many billing cycles.
pub const DISCOUNT_CYCLES: i32 = 3;

/// Commit attempts when credits are consumed concurrently.
const COMMIT_ATTEMPTS: usize = 2;

/// Invoice numbering and terms.
#[derive(Debug, Clone)]
pub struct InvoiceSettings {
    pub prefix: String,
    pub default_currency: String,
    pub payment_terms_days: i64,
}

impl Default for InvoiceSettings {
    fn default() -> Self {
        Self {
            prefix: "INV".to_string(),
            default_currency: "USD".to_string(),
            payment_terms_days: 30,
        }
    }
}

/// Base fee owed for the period. A contract that started inside the period
/// pays for the inclusive days from its start date to the last day of the
/// period. Periods are half-open like usage, so `period_end` itself belongs
/// to the next period.
pub fn prorated_base_fee(
    contract: &Contract,
    period_start: NaiveDate,
    period_end: NaiveDate,
) -> Result<Decimal, PricingError> {
    if period_end < period_start {
        return Err(PricingError::InvalidPeriod {
            start: period_start,
            end: period_end,
        });
    }
    if contract.start_date <= period_start {
        return Ok(contract.base_fee);
    }
    let last_day = period_end.pred_opt().ok_or(PricingError::DateOutOfRange)?;
    if contract.start_date > last_day {
        return Ok(Decimal::ZERO);
    }
    let total_days = days_between_inclusive(period_start, last_day);
    let used_days = days_between_inclusive(contract.start_date, last_day);
    daily_proration(contract.base_fee, total_days, used_days)
}

/// Pure invoice computation over the full base fee.
pub fn calculate_invoice_amounts(
    contract: &Contract,
    usage: Decimal,
    billing_cycle: i32,
    credits: &[Credit],
) -> Result<InvoiceAmounts, PricingError> {
    build_amounts(contract, contract.base_fee, usage, billing_cycle, credits)
}

fn percent_label(rate: Decimal) -> String {
    (rate * Decimal::ONE_HUNDRED).normalize().to_string()
}

fn build_amounts(
    contract: &Contract,
    base_fee: Decimal,
    usage: Decimal,
    billing_cycle: i32,
    credits: &[Credit],
) -> Result<InvoiceAmounts, PricingError> {
    if usage < Decimal::ZERO {
        return Err(PricingError::NegativeQuantity(usage));
    }

    let mut line_items = Vec::new();

    let base_fee = round_money(base_fee);
    if !base_fee.is_zero() {
        let description = if base_fee == contract.base_fee {
            "Base fee".to_string()
        } else {
            "Base fee (prorated)".to_string()
        };
        line_items.push(LineItem {
            line_type: LineType::BaseFee,
            description,
            quantity: Decimal::ONE,
            unit_price: base_fee,
            amount: base_fee,
        });
    }

    let overage = if contract.usage_tiers.is_empty() {
        let billable = (usage - contract.min_commit_calls).max(Decimal::ZERO);
        let amount = round_money(billable * contract.overage_fee);
        if !amount.is_zero() {
            line_items.push(LineItem {
                line_type: LineType::Overage,
                description: format!("Usage overage ({} units above commitment)", billable.normalize()),
                quantity: billable,
                unit_price: contract.overage_fee,
                amount,
            });
        }
        amount
    } else {
        let amount = tiered_usage_cost(&contract.usage_tiers, usage)?;
        if !amount.is_zero() {
            line_items.push(LineItem {
                line_type: LineType::Overage,
                description: format!("Tiered usage ({} units)", usage.normalize()),
                quantity: usage,
                unit_price: round_money(amount / usage),
                amount,
            });
        }
        amount
    };

    let subtotal = base_fee + overage;

    let discount_amount = if contract.discount_rate > Decimal::ZERO && billing_cycle <= DISCOUNT_CYCLES
    {
        round_money(subtotal * contract.discount_rate)
    } else {
        Decimal::ZERO
    };
    if !discount_amount.is_zero() {
        line_items.push(LineItem {
            line_type: LineType::Discount,
            description: format!(
                "Introductory discount ({}%)",
                percent_label(contract.discount_rate)
            ),
            quantity: Decimal::ONE,
            unit_price: -discount_amount,
            amount: -discount_amount,
        });
    }

    let credit_applications = plan_application(credits, subtotal - discount_amount, None);
    let credit_amount = total_applied(&credit_applications);
    if !credit_amount.is_zero() {
        line_items.push(LineItem {
            line_type: LineType::CreditOffset,
            description: format!("Account credits ({} applied)", credit_applications.len()),
            quantity: Decimal::ONE,
            unit_price: -credit_amount,
            amount: -credit_amount,
        });
    }

    Ok(InvoiceAmounts {
        subtotal,
        discount_amount,
        credit_amount,
        total: subtotal - discount_amount - credit_amount,
        line_items,
        credit_applications,
    })
}

#[derive(Clone)]
pub struct InvoiceGenerator {
    store: Arc<dyn BillingStore>,
    ledger: CreditLedger,
    events: Arc<dyn EventSink>,
    settings: InvoiceSettings,
}

impl InvoiceGenerator {
    pub fn new(
        store: Arc<dyn BillingStore>,
        ledger: CreditLedger,
        events: Arc<dyn EventSink>,
        settings: InvoiceSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            events,
            settings,
        }
    }

    pub fn settings(&self) -> &InvoiceSettings {
        &self.settings
    }

    /// Compute the invoice for a period without persisting anything.
    pub async fn preview(
        &self,
        contract: &Contract,
        usage: Decimal,
        period_start: NaiveDate,
        period_end: NaiveDate,
        billing_cycle: i32,
    ) -> Result<InvoiceAmounts, AppError> {
        let base_fee = prorated_base_fee(contract, period_start, period_end)?;
        let credits = self.store.list_unapplied_credits(contract.entity_id).await?;
        Ok(build_amounts(contract, base_fee, usage, billing_cycle, &credits)?)
    }

    /// Create the invoice for `(contract, period_start, period_end)`, or
    /// return the one that already exists for that period.
    #[instrument(skip(self, contract), fields(contract_id = %contract.contract_id, period_start = %period_start, period_end = %period_end))]
    pub async fn generate_invoice(
        &self,
        contract: &Contract,
        usage: Decimal,
        period_start: NaiveDate,
        period_end: NaiveDate,
        billing_cycle: i32,
    ) -> Result<CommittedInvoice, AppError> {
        if let Some(invoice) = self
            .store
            .find_invoice_for_period(contract.contract_id, period_start, period_end)
            .await?
        {
            debug!(invoice_id = %invoice.invoice_id, "Invoice already exists for period");
            let lines = self.store.get_invoice_lines(invoice.invoice_id).await?;
            return Ok(CommittedInvoice {
                invoice,
                lines,
                created: false,
            });
        }

        let currency = if contract.currency.is_empty() {
            self.settings.default_currency.clone()
        } else {
            contract.currency.clone()
        };
        let due_date = period_end
            .checked_add_signed(Duration::days(self.settings.payment_terms_days))
            .ok_or(PricingError::DateOutOfRange)?;

        let mut attempt = 0;
        let committed = loop {
            attempt += 1;
            let amounts = self
                .preview(contract, usage, period_start, period_end, billing_cycle)
                .await?;
            let year = Utc::now().year();
            let sequence = self.store.next_invoice_sequence(year).await?;

            let draft = InvoiceDraft {
                invoice: NewInvoice {
                    invoice_number: format_invoice_number(&self.settings.prefix, year, sequence),
                    contract_id: contract.contract_id,
                    customer_id: contract.entity_id,
                    period_start,
                    period_end,
                    billing_cycle,
                    subtotal: amounts.subtotal,
                    discount_amount: amounts.discount_amount,
                    credit_amount: amounts.credit_amount,
                    total: amounts.total,
                    currency: currency.clone(),
                    due_date,
                },
                lines: amounts.line_items,
                credit_applications: amounts.credit_applications,
            };

            match self.store.commit_invoice(&draft).await {
                Ok(committed) => {
                    if committed.created && !draft.credit_applications.is_empty() {
                        self.ledger.record_applied(
                            contract.entity_id,
                            Some(committed.invoice.invoice_id),
                            &draft.credit_applications,
                        );
                    }
                    break committed;
                }
                Err(AppError::Conflict(e)) if attempt < COMMIT_ATTEMPTS => {
                    warn!(error = %e, attempt, "Credits changed during invoicing, replanning");
                }
                Err(e) => return Err(e),
            }
        };

        if committed.created {
            let invoice = &committed.invoice;
            metrics::record_invoice_created(&invoice.currency, invoice.total);
            info!(
                invoice_id = %invoice.invoice_id,
                invoice_number = %invoice.invoice_number,
                total = %invoice.total,
                "Invoice generated"
            );
            self.events.publish(BillingEvent::InvoiceCreated {
                invoice_id: invoice.invoice_id,
                invoice_number: invoice.invoice_number.clone(),
                contract_id: invoice.contract_id,
                customer_id: invoice.customer_id,
                total: invoice.total,
                currency: invoice.currency.clone(),
            });
        }

        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreditType;
    use crate::pricing::PriceTier;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn contract() -> Contract {
        Contract {
            contract_id: Uuid::new_v4(),
            entity_id: Uuid::new_v4(),
            name: "Acme API".to_string(),
            status: "active".to_string(),
            currency: "USD".to_string(),
            base_fee: dec!(100),
            overage_fee: dec!(0.01),
            discount_rate: dec!(0.20),
            min_commit_calls: dec!(1000),
            usage_tiers: Vec::new(),
            start_date: d(2024, 1, 1),
            billing_anchor_day: None,
            billing_cycle: 1,
            next_billing_date: Some(d(2025, 2, 1)),
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        }
    }

    #[test]
    fn discount_applies_in_early_cycles() {
        let amounts = calculate_invoice_amounts(&contract(), dec!(3000), 1, &[]).unwrap();
        assert_eq!(amounts.subtotal, dec!(120));
        assert_eq!(amounts.discount_amount, dec!(24));
        assert_eq!(amounts.total, dec!(96));

        let json = serde_json::to_value(&amounts).unwrap();
        assert_eq!(json["discountAmount"], "24.0000");
        assert_eq!(json["total"], "96.0000");
    }

    #[test]
    fn discount_stops_after_third_cycle() {
        let third = calculate_invoice_amounts(&contract(), dec!(3000), 3, &[]).unwrap();
        assert_eq!(third.discount_amount, dec!(24));

        let fourth = calculate_invoice_amounts(&contract(), dec!(3000), 4, &[]).unwrap();
        assert_eq!(fourth.discount_amount, Decimal::ZERO);
        assert_eq!(fourth.total, dec!(120));
        assert!(fourth
            .line_items
            .iter()
            .all(|l| l.line_type != LineType::Discount));
    }

    #[test]
    fn usage_within_commitment_has_no_overage_line() {
        let amounts = calculate_invoice_amounts(&contract(), dec!(800), 4, &[]).unwrap();
        assert_eq!(amounts.line_items.len(), 1);
        assert_eq!(amounts.line_items[0].line_type, LineType::BaseFee);
        assert_eq!(amounts.total, dec!(100));
    }

    #[test]
    fn tiers_replace_flat_overage() {
        let mut c = contract();
        c.base_fee = Decimal::ZERO;
        c.discount_rate = Decimal::ZERO;
        c.usage_tiers = vec![
            PriceTier::bounded(dec!(1000), dec!(0)),
            PriceTier::bounded(dec!(1000000), dec!(0.002)),
            PriceTier::unbounded(dec!(0.001)),
        ];
        let amounts = calculate_invoice_amounts(&c, dec!(1500000), 1, &[]).unwrap();
        assert_eq!(amounts.total, dec!(2498));
        assert_eq!(amounts.line_items.len(), 1);
    }

    #[test]
    fn credits_offset_the_discounted_subtotal() {
        let c = contract();
        let credit = Credit {
            credit_id: Uuid::new_v4(),
            customer_id: c.entity_id,
            amount: dec!(200),
            credit_type: CreditType::Promotional.as_str().to_string(),
            description: "Welcome".to_string(),
            applied_utc: None,
            applied_amount: None,
            applied_to_invoice_id: None,
            metadata: None,
            created_utc: Utc::now(),
        };
        let amounts = calculate_invoice_amounts(&c, dec!(3000), 1, &[credit]).unwrap();
        assert_eq!(amounts.credit_amount, dec!(96));
        assert_eq!(amounts.total, Decimal::ZERO);
        assert_eq!(amounts.credit_applications[0].remainder, dec!(104));
        let last = amounts.line_items.last().unwrap();
        assert_eq!(last.line_type, LineType::CreditOffset);
        assert_eq!(last.amount, dec!(-96));
    }

    #[test]
    fn contract_starting_mid_period_pays_partial_base_fee() {
        let mut c = contract();
        c.start_date = d(2025, 2, 15);
        // Feb 1 ..= Feb 28 is 28 days; Feb 15 ..= Feb 28 is 14.
        let fee = prorated_base_fee(&c, d(2025, 2, 1), d(2025, 3, 1)).unwrap();
        assert_eq!(fee, dec!(50));

        // A contract starting on the period end owes nothing for this period.
        c.start_date = d(2025, 3, 1);
        let fee = prorated_base_fee(&c, d(2025, 2, 1), d(2025, 3, 1)).unwrap();
        assert_eq!(fee, Decimal::ZERO);

        c.start_date = d(2024, 12, 1);
        let fee = prorated_base_fee(&c, d(2025, 1, 1), d(2025, 2, 1)).unwrap();
        assert_eq!(fee, dec!(100));
    }
}
