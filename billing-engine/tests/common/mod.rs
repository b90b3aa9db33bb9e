#![allow(dead_code)]

use billing_engine::models::{
    BillingEvent, Contract, CreateContract, RecordUsage, UsageEvent, UsageEventType,
};
use billing_engine::pricing::BulkDiscountRule;
use billing_engine::services::{
    BillingOrchestrator, BillingStore, ChannelEventSink, CreditLedger, InvoiceSettings,
    MemoryStore, SubscriptionService,
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub orchestrator: BillingOrchestrator,
    pub subscriptions: SubscriptionService,
    pub events: UnboundedReceiver<BillingEvent>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with_rules(Vec::new()).await
    }

    pub async fn spawn_with_rules(bulk_rules: Vec<BulkDiscountRule>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let (sink, events) = ChannelEventSink::new();
        let sink = Arc::new(sink);

        let orchestrator =
            BillingOrchestrator::new(store.clone(), sink.clone(), InvoiceSettings::default());
        let subscriptions = SubscriptionService::new(store.clone(), sink, bulk_rules);

        Self {
            store,
            orchestrator,
            subscriptions,
            events,
        }
    }

    pub fn ledger(&self) -> &CreditLedger {
        self.orchestrator.ledger()
    }

    /// Contract with $100 base fee, $0.01 overage above 1000 calls and a
    /// 20% introductory discount, due on `next_billing_date`.
    pub async fn create_contract(
        &self,
        entity_id: Uuid,
        next_billing_date: NaiveDate,
    ) -> Contract {
        self.store
            .create_contract(&standard_contract(entity_id, next_billing_date))
            .await
            .expect("Failed to create contract")
    }

    pub async fn record_usage(
        &self,
        contract_id: Uuid,
        quantity: Decimal,
        timestamp: DateTime<Utc>,
    ) -> UsageEvent {
        self.orchestrator
            .discovery()
            .record_usage(&RecordUsage {
                contract_id,
                event_type: UsageEventType::ApiCall,
                quantity,
                timestamp,
                idempotency_key: None,
            })
            .await
            .expect("Failed to record usage")
    }

    pub async fn contract(&self, contract_id: Uuid) -> Contract {
        self.store
            .get_contract(contract_id)
            .await
            .expect("Failed to load contract")
            .expect("Contract not found")
    }

    /// Every event published so far, in order.
    pub fn drain_events(&mut self) -> Vec<BillingEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn standard_contract(entity_id: Uuid, next_billing_date: NaiveDate) -> CreateContract {
    CreateContract {
        entity_id,
        name: "Standard API plan".to_string(),
        currency: "USD".to_string(),
        base_fee: dec!(100),
        overage_fee: dec!(0.01),
        discount_rate: dec!(0.20),
        min_commit_calls: dec!(1000),
        usage_tiers: Vec::new(),
        start_date: date(2024, 1, 1),
        billing_anchor_day: None,
        next_billing_date: Some(next_billing_date),
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("Invalid date")
}

pub fn at(y: i32, m: u32, d: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, hour, 0, 0)
        .single()
        .expect("Invalid timestamp")
}
