//! Usage event model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Kinds of metered events accepted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageEventType {
    ApiCall,
    Compute,
    Storage,
    Message,
}

impl UsageEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageEventType::ApiCall => "api_call",
            UsageEventType::Compute => "compute",
            UsageEventType::Storage => "storage",
            UsageEventType::Message => "message",
        }
    }

    /// Strict parse; unknown event types are rejected rather than defaulted.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "api_call" => Some(UsageEventType::ApiCall),
            "compute" => Some(UsageEventType::Compute),
            "storage" => Some(UsageEventType::Storage),
            "message" => Some(UsageEventType::Message),
            _ => None,
        }
    }
}

/// Immutable metered fact.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageEvent {
    pub event_id: Uuid,
    pub contract_id: Uuid,
    pub event_type: String,
    pub quantity: Decimal,
    pub timestamp: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// Input for recording usage.
#[derive(Debug, Clone)]
pub struct RecordUsage {
    pub contract_id: Uuid,
    pub event_type: UsageEventType,
    pub quantity: Decimal,
    pub timestamp: DateTime<Utc>,
    pub idempotency_key: Option<String>,
}
