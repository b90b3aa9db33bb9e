//! Services module for billing-engine.

pub mod credit_ledger;
pub mod database;
pub mod discovery;
pub mod events;
pub mod invoice_generator;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod store;
pub mod subscriptions;

pub use credit_ledger::{plan_application, CreditLedger};
pub use database::Database;
pub use discovery::UsageDiscovery;
pub use events::{ChannelEventSink, EventSink, NoopEventSink, TracingEventSink};
pub use invoice_generator::{calculate_invoice_amounts, InvoiceGenerator, InvoiceSettings};
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use orchestrator::BillingOrchestrator;
pub use store::BillingStore;
pub use subscriptions::SubscriptionService;
