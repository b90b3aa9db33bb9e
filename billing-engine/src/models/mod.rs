//! Domain models for billing-engine.

mod billing_job;
mod contract;
mod credit;
mod event;
mod invoice;
pub mod money;
mod subscription;
mod usage;

pub use billing_job::{
    BillingJob, BillingRunSummary, CreateBillingJob, JobAcquisition, JobProgress, JobStatus,
    JobTrigger, CANCELLED_REASON, SHUTDOWN_REASON,
};
pub use contract::{Contract, ContractStatus, CreateContract};
pub use credit::{
    Credit, CreditApplication, CreditDeduction, CreditType, DeductionRejection,
    EntityCreditBalance, GrantCredit,
};
pub use event::BillingEvent;
pub use invoice::{
    format_invoice_number, CommittedInvoice, Invoice, InvoiceAmounts, InvoiceDraft, InvoiceLine,
    InvoiceStatus, LineItem, LineType, NewInvoice,
};
pub use subscription::{
    CreateEntitySubscription, EntitySubscription, SeatBillingCycle, SubscriptionStatus,
};
pub use usage::{RecordUsage, UsageEvent, UsageEventType};
