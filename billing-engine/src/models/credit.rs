//! Credit ledger models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Credit type. Determines application priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditType {
    Promotional,
    Refund,
    Manual,
    Adjustment,
}

impl CreditType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditType::Promotional => "promotional",
            CreditType::Refund => "refund",
            CreditType::Manual => "manual",
            CreditType::Adjustment => "adjustment",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "promotional" => CreditType::Promotional,
            "refund" => CreditType::Refund,
            "manual" => CreditType::Manual,
            _ => CreditType::Adjustment,
        }
    }

    /// Lower values are consumed first.
    pub fn priority(&self) -> u8 {
        match self {
            CreditType::Promotional => 0,
            CreditType::Refund => 1,
            CreditType::Manual => 2,
            CreditType::Adjustment => 3,
        }
    }
}

/// A monetary grant to a customer.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Credit {
    pub credit_id: Uuid,
    pub customer_id: Uuid,
    pub amount: Decimal,
    pub credit_type: String,
    pub description: String,
    pub applied_utc: Option<DateTime<Utc>>,
    pub applied_amount: Option<Decimal>,
    pub applied_to_invoice_id: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
}

impl Credit {
    pub fn kind(&self) -> CreditType {
        CreditType::from_string(&self.credit_type)
    }

    pub fn is_applied(&self) -> bool {
        self.applied_utc.is_some()
    }

    /// Credit this record reverses, if it is a reversal.
    pub fn reversal_of(&self) -> Option<Uuid> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("reversal_of"))
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

/// Input for granting a credit.
#[derive(Debug, Clone)]
pub struct GrantCredit {
    pub customer_id: Uuid,
    pub amount: Decimal,
    pub credit_type: CreditType,
    pub description: String,
    pub metadata: Option<serde_json::Value>,
}

/// One step of applying credits to an invoice.
///
/// The original credit is marked applied for `applied_amount`; when
/// `remainder` is non-zero a new credit carrying the rest is written in the
/// same transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditApplication {
    pub credit_id: Uuid,
    pub customer_id: Uuid,
    pub credit_type: CreditType,
    pub original_amount: Decimal,
    pub applied_amount: Decimal,
    pub remainder: Decimal,
    pub invoice_id: Option<Uuid>,
    pub original_created_utc: DateTime<Utc>,
}

impl CreditApplication {
    pub fn fully_consumed(&self) -> bool {
        self.remainder.is_zero()
    }

    /// Metadata recorded on the consumed credit.
    pub fn applied_metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "applied_amount": self.applied_amount.to_string(),
            "fully_consumed": self.fully_consumed(),
            "invoice_id": self.invoice_id.map(|id| id.to_string()),
        })
    }

    /// Metadata recorded on the remainder credit.
    pub fn remainder_metadata(&self) -> serde_json::Value {
        serde_json::json!({ "remainder_of": self.credit_id.to_string() })
    }
}

/// Per-entity prepaid balance.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EntityCreditBalance {
    pub entity_id: Uuid,
    pub total_credits: Decimal,
    pub used_credits: Decimal,
    pub user_credit_limit: Option<Decimal>,
    pub updated_utc: DateTime<Utc>,
}

impl EntityCreditBalance {
    pub fn available(&self) -> Decimal {
        self.total_credits - self.used_credits
    }

    pub fn is_consistent(&self) -> bool {
        self.used_credits <= self.total_credits
    }

    /// Positive per-request limit, if one is configured.
    pub fn effective_limit(&self) -> Option<Decimal> {
        self.user_credit_limit.filter(|l| *l > Decimal::ZERO)
    }
}

/// Why an entity-level deduction was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeductionRejection {
    InsufficientCredits,
    ExceedsUserLimit,
    NoBalance,
}

impl DeductionRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            DeductionRejection::InsufficientCredits => "Insufficient credits",
            DeductionRejection::ExceedsUserLimit => "Credit amount exceeds user limit",
            DeductionRejection::NoBalance => "No credit balance found for entity",
        }
    }
}

impl fmt::Display for DeductionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Outcome of an entity-level deduction. Refusals are values, not errors.
#[derive(Debug, Clone)]
pub enum CreditDeduction {
    Deducted(EntityCreditBalance),
    Rejected(DeductionRejection),
}

impl CreditDeduction {
    pub fn is_deducted(&self) -> bool {
        matches!(self, CreditDeduction::Deducted(_))
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            CreditDeduction::Deducted(_) => None,
            CreditDeduction::Rejected(r) => Some(r.reason()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn priority_orders_promotional_first() {
        let mut types = vec![
            CreditType::Adjustment,
            CreditType::Manual,
            CreditType::Promotional,
            CreditType::Refund,
        ];
        types.sort_by_key(|t| t.priority());
        assert_eq!(
            types,
            vec![
                CreditType::Promotional,
                CreditType::Refund,
                CreditType::Manual,
                CreditType::Adjustment
            ]
        );
    }

    #[test]
    fn rejection_reasons_are_exact() {
        assert_eq!(
            DeductionRejection::InsufficientCredits.to_string(),
            "Insufficient credits"
        );
        assert_eq!(
            DeductionRejection::ExceedsUserLimit.to_string(),
            "Credit amount exceeds user limit"
        );
        assert_eq!(
            DeductionRejection::NoBalance.to_string(),
            "No credit balance found for entity"
        );
    }

    #[test]
    fn non_positive_limit_is_ignored() {
        let balance = EntityCreditBalance {
            entity_id: Uuid::new_v4(),
            total_credits: dec!(100),
            used_credits: dec!(40),
            user_credit_limit: Some(Decimal::ZERO),
            updated_utc: Utc::now(),
        };
        assert_eq!(balance.available(), dec!(60));
        assert_eq!(balance.effective_limit(), None);
        assert!(balance.is_consistent());
    }

    #[test]
    fn reversal_reference_is_read_from_metadata() {
        let original = Uuid::new_v4();
        let credit = Credit {
            credit_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            amount: dec!(5),
            credit_type: CreditType::Adjustment.as_str().to_string(),
            description: "Reversal".to_string(),
            applied_utc: None,
            applied_amount: None,
            applied_to_invoice_id: None,
            metadata: Some(serde_json::json!({ "reversal_of": original.to_string() })),
            created_utc: Utc::now(),
        };
        assert_eq!(credit.reversal_of(), Some(original));
    }
}
