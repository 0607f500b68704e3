//! Biweekly hourly settlement: period aggregation, worker-side fees and
//! the period payment.

mod common;

use chrono::NaiveDate;
use common::{Harness, WORKER};
use escrow_engine::config::Environment;
use escrow_engine::db::{PaymentStatus, TimeEntryQueries, TimeEntryStatus};
use escrow_engine::gateway::GatewayError;
use escrow_engine::hourly::{HourlyService, PeriodAmounts};
use escrow_engine::notify::kind;
use escrow_engine::EngineError;
use rust_decimal::Decimal;

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn service(h: &Harness, environment: Environment) -> HourlyService {
    HourlyService::new(
        h.db.clone(),
        h.gateway.clone(),
        h.notifications.clone(),
        h.transfers(environment),
    )
}

#[tokio::test]
async fn test_period_aggregates_only_approved_entries_in_range() {
    let h = Harness::new().await;
    h.seed_profiles().await;
    let contract = h
        .seed_active_hourly_contract(dec("50"), Some(dec("40")), Some(date("2024-01-01")))
        .await;

    // Inside the second period (2024-01-15 .. 2024-01-28)
    h.seed_approved_time_entry(&contract.id, "t1", date("2024-01-16"), dec("6"))
        .await;
    h.seed_approved_time_entry(&contract.id, "t2", date("2024-01-18"), dec("4.5"))
        .await;
    // Outside the period
    h.seed_approved_time_entry(&contract.id, "t3", date("2024-01-05"), dec("8"))
        .await;
    // In range but still pending review
    let entries = TimeEntryQueries::new(&h.db);
    h.seed_approved_time_entry(&contract.id, "t4", date("2024-01-17"), dec("3"))
        .await;
    entries
        .set_status("t4", TimeEntryStatus::Pending)
        .await
        .unwrap();

    let summary = service(&h, Environment::Test)
        .period_as_of(&contract.id, date("2024-01-20"))
        .await
        .unwrap();

    assert_eq!(summary.period_index, 1);
    assert_eq!(summary.period_start, date("2024-01-15"));
    assert_eq!(summary.period_end, date("2024-01-28"));
    assert_eq!(summary.entry_count, 2);
    assert_eq!(summary.total_hours, dec("10.5"));
    assert_eq!(summary.gross_amount, dec("525"));
    // 8% of 525 = 42, plus 13% HST on the fee = 5.46
    assert_eq!(summary.fees.total_fee, dec("47.46"));
    assert_eq!(summary.net_amount, dec("477.54"));
}

#[tokio::test]
async fn test_process_period_payment_settles_and_marks_entries_paid() {
    let h = Harness::new().await;
    h.seed_profiles().await;
    let contract = h
        .seed_active_hourly_contract(dec("50"), Some(dec("40")), Some(date("2024-01-01")))
        .await;
    h.seed_approved_time_entry(&contract.id, "t1", date("2024-01-16"), dec("10"))
        .await;
    let svc = service(&h, Environment::Test);

    let summary = svc
        .period_as_of(&contract.id, date("2024-01-20"))
        .await
        .unwrap();
    let payment = svc
        .process_period_payment(
            &contract.id,
            summary.period_start,
            summary.period_end,
            PeriodAmounts::from(&summary),
        )
        .await
        .unwrap();

    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(payment.milestone_id, None);
    assert_eq!(payment.amount, dec("500"));
    assert_eq!(payment.net_amount, dec("454.80"));
    assert!(payment.transfer_ref.is_some());

    let entry = TimeEntryQueries::new(&h.db)
        .get("t1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, TimeEntryStatus::Paid);
    assert!(entry.paid_at.is_some());

    assert!(h
        .notifier
        .kinds_for(WORKER)
        .contains(&kind::PAYMENT_RECEIVED.to_string()));
}

#[tokio::test]
async fn test_insufficient_balance_is_simulated_outside_production() {
    let h = Harness::new().await;
    h.seed_profiles().await;
    let contract = h
        .seed_active_hourly_contract(dec("50"), Some(dec("40")), Some(date("2024-01-01")))
        .await;
    h.seed_approved_time_entry(&contract.id, "t1", date("2024-01-16"), dec("10"))
        .await;
    let svc = service(&h, Environment::Development);

    h.gateway
        .fail_next_transfer(GatewayError::InsufficientBalance("sandbox empty".into()));
    let summary = svc
        .period_as_of(&contract.id, date("2024-01-20"))
        .await
        .unwrap();
    let payment = svc
        .process_period_payment(
            &contract.id,
            summary.period_start,
            summary.period_end,
            PeriodAmounts::from(&summary),
        )
        .await
        .unwrap();

    // Settlement completed against a synthetic transfer reference
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert!(payment.transfer_ref.unwrap().starts_with("tr_sim_"));
}

#[tokio::test]
async fn test_insufficient_balance_fails_in_production() {
    let h = Harness::new().await;
    h.seed_profiles().await;
    let contract = h
        .seed_active_hourly_contract(dec("50"), Some(dec("40")), Some(date("2024-01-01")))
        .await;
    h.seed_approved_time_entry(&contract.id, "t1", date("2024-01-16"), dec("10"))
        .await;
    let svc = service(&h, Environment::Production);

    h.gateway
        .fail_next_transfer(GatewayError::InsufficientBalance("balance empty".into()));
    let summary = svc
        .period_as_of(&contract.id, date("2024-01-20"))
        .await
        .unwrap();
    let err = svc
        .process_period_payment(
            &contract.id,
            summary.period_start,
            summary.period_end,
            PeriodAmounts::from(&summary),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Upstream(_)));

    // Entries stay approved so the period can be retried
    let entry = TimeEntryQueries::new(&h.db)
        .get("t1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, TimeEntryStatus::Approved);
}

#[tokio::test]
async fn test_empty_period_has_nothing_payable() {
    let h = Harness::new().await;
    h.seed_profiles().await;
    let contract = h
        .seed_active_hourly_contract(dec("50"), Some(dec("40")), Some(date("2024-01-01")))
        .await;
    let svc = service(&h, Environment::Test);

    let summary = svc
        .period_as_of(&contract.id, date("2024-01-20"))
        .await
        .unwrap();
    assert_eq!(summary.entry_count, 0);
    assert_eq!(summary.net_amount, dec("0"));

    let err = svc
        .process_period_payment(
            &contract.id,
            summary.period_start,
            summary.period_end,
            PeriodAmounts::from(&summary),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_fixed_contract_has_no_pay_periods() {
    let h = Harness::new().await;
    h.seed_profiles().await;
    let contract = h.seed_active_fixed_contract(dec("1000")).await;

    let err = service(&h, Environment::Test)
        .period_as_of(&contract.id, date("2024-01-20"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
}
