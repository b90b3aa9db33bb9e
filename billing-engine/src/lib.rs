//! Billing Engine - idempotent billing runs, invoice generation, credit
//! ledger and proration for marketplace entities.

pub mod config;
pub mod models;
pub mod pricing;
pub mod services;
pub mod startup;
