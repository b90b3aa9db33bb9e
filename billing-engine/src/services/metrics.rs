//! Metrics module for billing-engine.
//! Provides Prometheus metrics for billing jobs, invoices and the credit ledger.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram_vec, register_int_counter_vec,
    CounterVec, Encoder, HistogramVec, IntCounterVec, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Billing jobs counter by trigger and final status
pub static BILLING_JOBS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Billing job wall-clock duration
pub static BILLING_JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Invoices created counter
pub static INVOICES_CREATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoiced amount by currency (monetary tracking)
pub static INVOICE_AMOUNT_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Contracts skipped during a run, by error kind
pub static CONTRACT_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Credit amount applied to invoices, by credit type
pub static CREDITS_APPLIED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Entity-level credit deductions by outcome
pub static ENTITY_DEDUCTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    BILLING_JOBS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_jobs_total", "Total billing jobs by trigger and status"),
            &["trigger", "status"]
        )
        .expect("Failed to register BILLING_JOBS_TOTAL")
    });

    BILLING_JOB_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "billing_job_duration_seconds",
                "Billing job duration",
                vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0]
            ),
            &["trigger"]
        )
        .expect("Failed to register BILLING_JOB_DURATION")
    });

    INVOICES_CREATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_invoices_created_total", "Total invoices created"),
            &["currency"]
        )
        .expect("Failed to register INVOICES_CREATED_TOTAL")
    });

    INVOICE_AMOUNT_TOTAL.get_or_init(|| {
        register_counter_vec!(
            opts!(
                "billing_invoice_amount_total",
                "Total invoiced amount by currency"
            ),
            &["currency"]
        )
        .expect("Failed to register INVOICE_AMOUNT_TOTAL")
    });

    CONTRACT_FAILURES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_contract_failures_total",
                "Contracts skipped during billing runs by error kind"
            ),
            &["error_type"]
        )
        .expect("Failed to register CONTRACT_FAILURES_TOTAL")
    });

    CREDITS_APPLIED_TOTAL.get_or_init(|| {
        register_counter_vec!(
            opts!(
                "billing_credits_applied_total",
                "Credit amount applied to invoices by credit type"
            ),
            &["credit_type"]
        )
        .expect("Failed to register CREDITS_APPLIED_TOTAL")
    });

    ENTITY_DEDUCTIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_entity_deductions_total",
                "Entity credit deductions by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register ENTITY_DEDUCTIONS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a finished billing job.
pub fn record_billing_job(trigger: &str, status: &str, duration_secs: f64) {
    if let Some(counter) = BILLING_JOBS_TOTAL.get() {
        counter.with_label_values(&[trigger, status]).inc();
    }
    if let Some(histogram) = BILLING_JOB_DURATION.get() {
        histogram.with_label_values(&[trigger]).observe(duration_secs);
    }
}

/// Record an invoice created.
pub fn record_invoice_created(currency: &str, total: Decimal) {
    if let Some(counter) = INVOICES_CREATED_TOTAL.get() {
        counter.with_label_values(&[currency]).inc();
    }
    if let Some(counter) = INVOICE_AMOUNT_TOTAL.get() {
        counter
            .with_label_values(&[currency])
            .inc_by(total.abs().to_f64().unwrap_or(0.0));
    }
}

/// Record a contract skipped by a billing run.
pub fn record_contract_failure(error_type: &str) {
    if let Some(counter) = CONTRACT_FAILURES_TOTAL.get() {
        counter.with_label_values(&[error_type]).inc();
    }
}

/// Record credit applied to an invoice.
pub fn record_credit_applied(credit_type: &str, amount: Decimal) {
    if let Some(counter) = CREDITS_APPLIED_TOTAL.get() {
        counter
            .with_label_values(&[credit_type])
            .inc_by(amount.abs().to_f64().unwrap_or(0.0));
    }
}

/// Record an entity-level deduction attempt.
pub fn record_entity_deduction(outcome: &str) {
    if let Some(counter) = ENTITY_DEDUCTIONS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}
