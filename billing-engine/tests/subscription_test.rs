mod common;

use billing_engine::models::{
    BillingEvent, CreateEntitySubscription, EntitySubscription, SeatBillingCycle,
    SubscriptionStatus,
};
use billing_engine::pricing::{BulkDiscountRule, ProrationAdjustment};
use chrono::NaiveDate;
use common::{date, TestApp};
use rust_decimal_macros::dec;
use service_core::error::AppError;
use uuid::Uuid;

async fn subscribe(
    app: &TestApp,
    seats: i32,
    cycle: SeatBillingCycle,
    start: NaiveDate,
) -> EntitySubscription {
    app.subscriptions
        .create_subscription(&CreateEntitySubscription {
            entity_id: Uuid::new_v4(),
            seat_count: seats,
            price_per_seat: dec!(10),
            billing_cycle: cycle,
            start_date: start,
        })
        .await
        .expect("Failed to create subscription")
}

#[tokio::test]
async fn new_subscription_is_due_one_cycle_later() {
    let app = TestApp::spawn().await;
    let monthly = subscribe(&app, 10, SeatBillingCycle::Monthly, date(2025, 3, 1)).await;
    let annual = subscribe(&app, 10, SeatBillingCycle::Annual, date(2025, 3, 1)).await;

    assert_eq!(monthly.subscription_status(), SubscriptionStatus::Active);
    assert_eq!(monthly.next_billing_date, date(2025, 4, 1));
    assert_eq!(annual.next_billing_date, date(2026, 3, 1));
}

#[tokio::test]
async fn invalid_subscription_is_rejected() {
    let app = TestApp::spawn().await;
    let err = app
        .subscriptions
        .create_subscription(&CreateEntitySubscription {
            entity_id: Uuid::new_v4(),
            seat_count: 0,
            price_per_seat: dec!(10),
            billing_cycle: SeatBillingCycle::Monthly,
            start_date: date(2025, 3, 1),
        })
        .await
        .expect_err("Zero seats must be rejected");
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
async fn adding_seats_mid_cycle_charges_the_difference() {
    let mut app = TestApp::spawn().await;
    let sub = subscribe(&app, 10, SeatBillingCycle::Monthly, date(2025, 3, 1)).await;

    let change = app
        .subscriptions
        .change_seats(sub.subscription_id, 20, date(2025, 3, 16))
        .await
        .expect("Seat change failed");

    assert_eq!(change.subscription.seat_count, 20);
    assert_eq!(change.proration.total_days, 31);
    assert_eq!(change.proration.days_on_old_plan, 16);
    assert_eq!(change.proration.days_on_new_plan, 15);
    // 100 × 15 / 31
    assert_eq!(
        change.proration.adjustment,
        ProrationAdjustment::ChargeDue(dec!(48.3871))
    );

    let events = app.drain_events();
    assert!(matches!(
        events.as_slice(),
        [BillingEvent::SeatsChanged { old_seats: 10, new_seats: 20, .. }]
    ));
}

#[tokio::test]
async fn removing_seats_mid_cycle_credits_the_difference() {
    let app = TestApp::spawn().await;
    let sub = subscribe(&app, 10, SeatBillingCycle::Monthly, date(2025, 3, 1)).await;

    let change = app
        .subscriptions
        .change_seats(sub.subscription_id, 5, date(2025, 3, 16))
        .await
        .expect("Seat change failed");

    assert_eq!(
        change.proration.adjustment,
        ProrationAdjustment::CreditDue(dec!(24.1935))
    );
}

#[tokio::test]
async fn paused_subscription_cannot_change_seats() {
    let app = TestApp::spawn().await;
    let sub = subscribe(&app, 10, SeatBillingCycle::Monthly, date(2025, 3, 1)).await;
    let id = sub.subscription_id;

    let paused = app.subscriptions.pause(id).await.expect("Pause failed");
    assert_eq!(paused.subscription_status(), SubscriptionStatus::Paused);

    let err = app
        .subscriptions
        .change_seats(id, 12, date(2025, 3, 5))
        .await
        .expect_err("Paused subscription must not change seats");
    assert!(matches!(err, AppError::Conflict(_)));
    let err = app
        .subscriptions
        .pause(id)
        .await
        .expect_err("Double pause must fail");
    assert!(matches!(err, AppError::Conflict(_)));

    let resumed = app.subscriptions.resume(id).await.expect("Resume failed");
    assert_eq!(resumed.subscription_status(), SubscriptionStatus::Active);
}

#[tokio::test]
async fn cancellation_bills_through_the_grace_window() {
    let app = TestApp::spawn().await;
    let short = subscribe(&app, 10, SeatBillingCycle::Monthly, date(2025, 3, 1)).await;
    let long = subscribe(&app, 10, SeatBillingCycle::Monthly, date(2025, 3, 1)).await;

    let cancellation = app
        .subscriptions
        .cancel(short.subscription_id, date(2025, 3, 10), 5)
        .await
        .expect("Cancel failed");
    assert_eq!(cancellation.final_charge.service_end, date(2025, 3, 15));
    assert_eq!(cancellation.final_charge.billable_days, 15);
    assert_eq!(cancellation.final_charge.amount, dec!(48.3871));
    assert_eq!(
        cancellation.subscription.subscription_status(),
        SubscriptionStatus::Canceled
    );
    assert!(cancellation.subscription.canceled_utc.is_some());

    // Grace past the cycle end is capped at the cycle end.
    let capped = app
        .subscriptions
        .cancel(long.subscription_id, date(2025, 3, 20), 30)
        .await
        .expect("Cancel failed");
    assert_eq!(capped.final_charge.service_end, date(2025, 3, 31));
    assert_eq!(capped.final_charge.amount, dec!(100));

    let err = app
        .subscriptions
        .cancel(short.subscription_id, date(2025, 3, 11), 0)
        .await
        .expect_err("Double cancel must fail");
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn annual_renewal_applies_bulk_discount() {
    let app = TestApp::spawn_with_rules(vec![BulkDiscountRule {
        min_quantity: dec!(100),
        percent_off: dec!(10),
    }])
    .await;
    let sub = subscribe(&app, 150, SeatBillingCycle::Annual, date(2025, 1, 1)).await;

    let renewal = app
        .subscriptions
        .advance_subscription(sub.subscription_id)
        .await
        .expect("Renewal failed");

    assert_eq!(renewal.charge.base_amount, dec!(18000));
    assert_eq!(renewal.charge.discount_amount, dec!(1800));
    assert_eq!(renewal.charge.final_amount, dec!(16200));
    assert_eq!(renewal.subscription.current_period_start, date(2026, 1, 1));
    assert_eq!(renewal.subscription.next_billing_date, date(2027, 1, 1));
}

#[tokio::test]
async fn month_end_subscription_stays_at_month_end() {
    let app = TestApp::spawn().await;
    let sub = subscribe(&app, 1, SeatBillingCycle::Monthly, date(2025, 1, 31)).await;
    assert_eq!(sub.next_billing_date, date(2025, 2, 28));

    let renewal = app
        .subscriptions
        .advance_subscription(sub.subscription_id)
        .await
        .expect("Renewal failed");
    assert_eq!(renewal.subscription.current_period_start, date(2025, 2, 28));
    assert_eq!(renewal.subscription.next_billing_date, date(2025, 3, 31));
}

#[tokio::test]
async fn only_active_subscriptions_are_due() {
    let app = TestApp::spawn().await;
    let active = subscribe(&app, 3, SeatBillingCycle::Monthly, date(2025, 3, 1)).await;
    let paused = subscribe(&app, 3, SeatBillingCycle::Monthly, date(2025, 3, 1)).await;
    subscribe(&app, 3, SeatBillingCycle::Monthly, date(2025, 3, 15)).await;
    app.subscriptions
        .pause(paused.subscription_id)
        .await
        .expect("Pause failed");

    let due = app
        .subscriptions
        .find_due(date(2025, 4, 1))
        .await
        .expect("Lookup failed");

    assert_eq!(due.len(), 1);
    assert_eq!(due[0].subscription_id, active.subscription_id);
}
