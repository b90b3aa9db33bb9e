//! Invoice and invoice line models.

use crate::models::credit::CreditApplication;
use crate::models::money::fixed4;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Open,
    Paid,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Open => "open",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "paid" => InvoiceStatus::Paid,
            "void" => InvoiceStatus::Void,
            _ => InvoiceStatus::Open,
        }
    }
}

/// Component an invoice line represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineType {
    BaseFee,
    Overage,
    Discount,
    CreditOffset,
}

impl LineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineType::BaseFee => "base_fee",
            LineType::Overage => "overage",
            LineType::Discount => "discount",
            LineType::CreditOffset => "credit_offset",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "overage" => LineType::Overage,
            "discount" => LineType::Discount,
            "credit_offset" => LineType::CreditOffset,
            _ => LineType::BaseFee,
        }
    }
}

/// Persisted invoice header.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub contract_id: Uuid,
    pub customer_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub billing_cycle: i32,
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub credit_amount: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub due_date: NaiveDate,
    pub status: String,
    pub created_utc: DateTime<Utc>,
}

impl Invoice {
    pub fn invoice_status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }
}

/// Persisted invoice line.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceLine {
    pub line_id: Uuid,
    pub invoice_id: Uuid,
    pub line_type: String,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub amount: Decimal,
    pub sort_order: i32,
    pub created_utc: DateTime<Utc>,
}

/// Computed line item, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub line_type: LineType,
    pub description: String,
    #[serde(with = "fixed4")]
    pub quantity: Decimal,
    #[serde(with = "fixed4")]
    pub unit_price: Decimal,
    #[serde(with = "fixed4")]
    pub amount: Decimal,
}

/// Result of the pure invoice computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceAmounts {
    #[serde(with = "fixed4")]
    pub subtotal: Decimal,
    #[serde(with = "fixed4")]
    pub discount_amount: Decimal,
    #[serde(with = "fixed4")]
    pub credit_amount: Decimal,
    #[serde(with = "fixed4")]
    pub total: Decimal,
    pub line_items: Vec<LineItem>,
    #[serde(skip)]
    pub credit_applications: Vec<CreditApplication>,
}

/// Header fields of an invoice about to be written.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub invoice_number: String,
    pub contract_id: Uuid,
    pub customer_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub billing_cycle: i32,
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub credit_amount: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub due_date: NaiveDate,
}

/// Everything written in one invoice transaction.
#[derive(Debug, Clone)]
pub struct InvoiceDraft {
    pub invoice: NewInvoice,
    pub lines: Vec<LineItem>,
    pub credit_applications: Vec<CreditApplication>,
}

/// Outcome of committing an invoice draft.
#[derive(Debug, Clone)]
pub struct CommittedInvoice {
    pub invoice: Invoice,
    pub lines: Vec<InvoiceLine>,
    /// False when an invoice already existed for the same period.
    pub created: bool,
}

/// Format an invoice number: `{prefix}-{year}-{sequence:06}`.
pub fn format_invoice_number(prefix: &str, year: i32, sequence: i64) -> String {
    format!("{}-{}-{:06}", prefix, year, sequence)
}
