mod common;

use billing_engine::models::money::to_fixed;
use billing_engine::models::{format_invoice_number, CreditType, JobTrigger, LineType};
use billing_engine::pricing::PriceTier;
use billing_engine::services::BillingStore;
use chrono::{Datelike, Utc};
use common::{at, date, standard_contract, TestApp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn first_cycle_invoice_has_base_overage_and_discount_lines() {
    let app = TestApp::spawn().await;
    let contract = app.create_contract(Uuid::new_v4(), date(2025, 2, 1)).await;

    let committed = app
        .orchestrator
        .generator()
        .generate_invoice(&contract, dec!(3000), date(2025, 1, 1), date(2025, 2, 1), 1)
        .await
        .expect("Invoice generation failed");

    assert!(committed.created);
    let invoice = &committed.invoice;
    assert_eq!(invoice.subtotal, dec!(120));
    assert_eq!(invoice.discount_amount, dec!(24));
    assert_eq!(invoice.credit_amount, Decimal::ZERO);
    assert_eq!(to_fixed(invoice.total), "96.0000");
    assert_eq!(invoice.currency, "USD");
    assert_eq!(invoice.status, "open");
    assert_eq!(invoice.due_date, date(2025, 3, 3));
    assert_eq!(
        invoice.invoice_number,
        format_invoice_number("INV", Utc::now().year(), 1)
    );

    let types: Vec<&str> = committed.lines.iter().map(|l| l.line_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            LineType::BaseFee.as_str(),
            LineType::Overage.as_str(),
            LineType::Discount.as_str()
        ]
    );
    let orders: Vec<i32> = committed.lines.iter().map(|l| l.sort_order).collect();
    assert_eq!(orders, vec![0, 1, 2]);
    assert_eq!(committed.lines[1].quantity, dec!(2000));
    assert_eq!(committed.lines[2].amount, dec!(-24));
}

#[tokio::test]
async fn repeated_generation_returns_the_existing_invoice() {
    let app = TestApp::spawn().await;
    let contract = app.create_contract(Uuid::new_v4(), date(2025, 2, 1)).await;
    let generator = app.orchestrator.generator();

    let first = generator
        .generate_invoice(&contract, dec!(3000), date(2025, 1, 1), date(2025, 2, 1), 1)
        .await
        .expect("Invoice generation failed");
    let lines_after_first = app.store.line_count().await;

    let second = generator
        .generate_invoice(&contract, dec!(9000), date(2025, 1, 1), date(2025, 2, 1), 1)
        .await
        .expect("Invoice generation failed");

    assert!(!second.created);
    assert_eq!(second.invoice.invoice_id, first.invoice.invoice_id);
    assert_eq!(second.invoice.total, first.invoice.total);
    assert_eq!(app.store.invoice_count().await, 1);
    assert_eq!(app.store.line_count().await, lines_after_first);
}

#[tokio::test]
async fn discount_ends_after_the_third_cycle() {
    let app = TestApp::spawn().await;
    let contract = app.create_contract(Uuid::new_v4(), date(2025, 4, 1)).await;
    let generator = app.orchestrator.generator();

    let third = generator
        .generate_invoice(&contract, dec!(3000), date(2025, 3, 1), date(2025, 4, 1), 3)
        .await
        .expect("Invoice generation failed");
    let fourth = generator
        .generate_invoice(&contract, dec!(3000), date(2025, 4, 1), date(2025, 5, 1), 4)
        .await
        .expect("Invoice generation failed");

    assert_eq!(third.invoice.total, dec!(96));
    assert_eq!(fourth.invoice.discount_amount, Decimal::ZERO);
    assert_eq!(fourth.invoice.total, dec!(120));
    assert!(fourth
        .lines
        .iter()
        .all(|l| l.line_type != LineType::Discount.as_str()));
}

#[tokio::test]
async fn usage_on_the_period_end_belongs_to_the_next_invoice() {
    let app = TestApp::spawn().await;
    let contract = app.create_contract(Uuid::new_v4(), date(2025, 2, 1)).await;
    app.record_usage(contract.contract_id, dec!(1500), at(2025, 1, 1, 0))
        .await;
    app.record_usage(contract.contract_id, dec!(5000), at(2025, 2, 1, 0))
        .await;

    app.orchestrator
        .run_billing_job(date(2025, 2, 1), JobTrigger::Scheduled, None)
        .await
        .expect("Run failed");

    let invoices = app
        .store
        .list_invoices_for_contract(contract.contract_id)
        .await
        .expect("List failed");
    assert_eq!(invoices.len(), 1);
    // 100 base + 500 calls of overage, less 20%.
    assert_eq!(invoices[0].subtotal, dec!(105));
    assert_eq!(invoices[0].total, dec!(84));
}

#[tokio::test]
async fn credits_reduce_the_invoice_and_are_marked_applied() {
    let mut app = TestApp::spawn().await;
    let entity = Uuid::new_v4();
    let contract = app.create_contract(entity, date(2025, 2, 1)).await;
    let credit = app
        .ledger()
        .grant_credit(entity, dec!(50), CreditType::Promotional, "Welcome offer")
        .await
        .expect("Grant failed");

    let committed = app
        .orchestrator
        .generator()
        .generate_invoice(&contract, dec!(3000), date(2025, 1, 1), date(2025, 2, 1), 1)
        .await
        .expect("Invoice generation failed");

    assert_eq!(committed.invoice.credit_amount, dec!(50));
    assert_eq!(committed.invoice.total, dec!(46));
    let offset = committed
        .lines
        .iter()
        .find(|l| l.line_type == LineType::CreditOffset.as_str())
        .expect("Missing credit line");
    assert_eq!(offset.amount, dec!(-50));

    let applied = app
        .store
        .find_credits_applied_to(committed.invoice.invoice_id)
        .await
        .expect("Lookup failed");
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].credit_id, credit.credit_id);
    assert_eq!(applied[0].applied_amount, Some(dec!(50)));
    assert_eq!(
        app.ledger().available_credit(entity).await.expect("Lookup failed"),
        Decimal::ZERO
    );

    let types: Vec<&str> = app.drain_events().iter().map(|e| e.event_type()).collect();
    assert_eq!(types, vec!["credits_applied", "invoice_created"]);
}

#[tokio::test]
async fn oversized_credit_leaves_a_remainder() {
    let app = TestApp::spawn().await;
    let entity = Uuid::new_v4();
    let contract = app.create_contract(entity, date(2025, 2, 1)).await;
    let credit = app
        .ledger()
        .grant_credit(entity, dec!(200), CreditType::Refund, "Outage refund")
        .await
        .expect("Grant failed");

    let committed = app
        .orchestrator
        .generator()
        .generate_invoice(&contract, dec!(3000), date(2025, 1, 1), date(2025, 2, 1), 1)
        .await
        .expect("Invoice generation failed");

    assert_eq!(committed.invoice.credit_amount, dec!(96));
    assert_eq!(committed.invoice.total, Decimal::ZERO);

    let remaining = app
        .store
        .list_unapplied_credits(entity)
        .await
        .expect("Lookup failed");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].amount, dec!(104));
    assert_eq!(remaining[0].kind(), CreditType::Refund);
    assert_eq!(remaining[0].created_utc, credit.created_utc);
    assert_eq!(
        remaining[0].metadata.as_ref().and_then(|m| m.get("remainder_of")),
        Some(&serde_json::json!(credit.credit_id.to_string()))
    );

    // Nothing is created or lost by splitting the credit.
    let all = app.store.list_credits(entity).await.expect("Lookup failed");
    let applied: Decimal = all.iter().filter_map(|c| c.applied_amount).sum();
    assert_eq!(applied + remaining[0].amount, credit.amount);
}

#[tokio::test]
async fn failed_commit_leaves_no_invoice_and_no_consumed_credit() {
    let app = TestApp::spawn().await;
    let entity = Uuid::new_v4();
    let contract = app.create_contract(entity, date(2025, 2, 1)).await;
    app.ledger()
        .grant_credit(entity, dec!(30), CreditType::Manual, "Goodwill")
        .await
        .expect("Grant failed");
    app.store.inject_failure("commit_invoice").await;

    let result = app
        .orchestrator
        .generator()
        .generate_invoice(&contract, dec!(3000), date(2025, 1, 1), date(2025, 2, 1), 1)
        .await;

    assert!(result.is_err());
    assert_eq!(app.store.invoice_count().await, 0);
    assert_eq!(app.store.line_count().await, 0);
    assert_eq!(
        app.ledger().available_credit(entity).await.expect("Lookup failed"),
        dec!(30)
    );
}

#[tokio::test]
async fn invoice_number_year_matches_its_counter() {
    let app = TestApp::spawn().await;
    let contract = app.create_contract(Uuid::new_v4(), date(2025, 2, 1)).await;

    let committed = app
        .orchestrator
        .generator()
        .generate_invoice(&contract, Decimal::ZERO, date(2025, 1, 1), date(2025, 2, 1), 1)
        .await
        .expect("Invoice generation failed");

    let number = &committed.invoice.invoice_number;
    let year: i32 = number
        .split('-')
        .nth(1)
        .and_then(|y| y.parse().ok())
        .expect("Invoice number has no year");
    assert_eq!(app.store.invoice_sequence(year).await, Some(1));
    assert_eq!(number, &format_invoice_number("INV", year, 1));
}

#[tokio::test]
async fn invoice_numbers_increase_within_the_year() {
    let app = TestApp::spawn().await;
    app.create_contract(Uuid::new_v4(), date(2025, 2, 1)).await;
    app.create_contract(Uuid::new_v4(), date(2025, 2, 1)).await;

    app.orchestrator
        .run_billing_job(date(2025, 2, 1), JobTrigger::Scheduled, None)
        .await
        .expect("Run failed");

    let year = Utc::now().year();
    let mut numbers = Vec::new();
    for contract in app
        .orchestrator
        .discovery()
        .find_contracts_due(date(2025, 3, 1), None)
        .await
        .expect("Discovery failed")
    {
        for invoice in app
            .store
            .list_invoices_for_contract(contract.contract_id)
            .await
            .expect("List failed")
        {
            numbers.push(invoice.invoice_number);
        }
    }
    numbers.sort();
    assert_eq!(
        numbers,
        vec![
            format_invoice_number("INV", year, 1),
            format_invoice_number("INV", year, 2)
        ]
    );
}

#[tokio::test]
async fn rerun_after_invoice_exists_only_advances_the_contract() {
    let app = TestApp::spawn().await;
    let contract = app.create_contract(Uuid::new_v4(), date(2025, 2, 1)).await;
    app.orchestrator
        .generator()
        .generate_invoice(&contract, Decimal::ZERO, date(2025, 1, 1), date(2025, 2, 1), 1)
        .await
        .expect("Invoice generation failed");

    let summary = app
        .orchestrator
        .run_billing_job(date(2025, 2, 1), JobTrigger::Manual, None)
        .await
        .expect("Run failed");

    assert!(summary.success);
    assert_eq!(summary.processed_customers, 1);
    assert_eq!(summary.invoices_created, 0);
    assert_eq!(app.store.invoice_count().await, 1);
    let contract = app.contract(contract.contract_id).await;
    assert_eq!(contract.next_billing_date, Some(date(2025, 3, 1)));
    assert_eq!(contract.billing_cycle, 2);
}

#[tokio::test]
async fn contract_starting_mid_period_pays_a_prorated_base_fee() {
    let app = TestApp::spawn().await;
    let mut input = standard_contract(Uuid::new_v4(), date(2025, 3, 1));
    input.start_date = date(2025, 2, 15);
    let contract = app
        .store
        .create_contract(&input)
        .await
        .expect("Failed to create contract");

    let committed = app
        .orchestrator
        .generator()
        .generate_invoice(&contract, Decimal::ZERO, date(2025, 2, 1), date(2025, 3, 1), 1)
        .await
        .expect("Invoice generation failed");

    // Feb 15 through Feb 28: 14 of 28 days. Mar 1 opens the next period.
    assert_eq!(committed.invoice.subtotal, dec!(50));
    assert_eq!(committed.invoice.total, dec!(40));
    assert_eq!(committed.lines[0].description, "Base fee (prorated)");
}

#[tokio::test]
async fn tiered_contract_prices_usage_by_tier() {
    let app = TestApp::spawn().await;
    let mut input = standard_contract(Uuid::new_v4(), date(2025, 2, 1));
    input.discount_rate = Decimal::ZERO;
    input.usage_tiers = vec![
        PriceTier::bounded(dec!(1000), dec!(0)),
        PriceTier::bounded(dec!(1000000), dec!(0.002)),
        PriceTier::unbounded(dec!(0.001)),
    ];
    let contract = app
        .store
        .create_contract(&input)
        .await
        .expect("Failed to create contract");

    let committed = app
        .orchestrator
        .generator()
        .generate_invoice(
            &contract,
            dec!(1500000),
            date(2025, 1, 1),
            date(2025, 2, 1),
            1,
        )
        .await
        .expect("Invoice generation failed");

    assert_eq!(committed.invoice.subtotal, dec!(2598));
    assert_eq!(committed.invoice.total, dec!(2598));
}
