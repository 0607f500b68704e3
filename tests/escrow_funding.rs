//! Escrow funding flow: initiation, fee/tax math at the escrow boundary,
//! idempotent confirmation, and the funding preconditions.

mod common;

use common::{Harness, SPONSOR, WORKER};
use escrow_engine::db::{
    is_unique_violation, ContractQueries, ContractStatus, EscrowQueries, EscrowStatus,
    ProfileQueries, TxnType,
};
use escrow_engine::escrow::EscrowService;
use escrow_engine::notify::kind;
use escrow_engine::{codes, EngineError};
use rust_decimal::Decimal;

fn service(h: &Harness) -> EscrowService {
    EscrowService::new(
        h.db.clone(),
        h.gateway.clone(),
        h.notifications.clone(),
        "cad".to_string(),
    )
}

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_initiate_funding_computes_fee_and_tax() {
    let h = Harness::new().await;
    h.seed_profiles().await;
    let contract = h.seed_active_fixed_contract(dec("1000")).await;

    let initiation = service(&h)
        .initiate_funding(&contract.id, None)
        .await
        .unwrap();

    // 8% platform fee on 1000, plus Ontario HST (13%) on the fee
    assert_eq!(initiation.base_amount, dec("1000"));
    assert_eq!(initiation.fees.base_fee, dec("80"));
    assert_eq!(initiation.fees.tax_amount, dec("10.40"));
    assert_eq!(initiation.total_amount, dec("1090.40"));
    assert!(!initiation.already_funded);
    assert!(initiation.payment_handle.ends_with("_secret"));

    let account = EscrowQueries::new(&h.db)
        .account_by_contract(&contract.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.status, EscrowStatus::PendingFunding);
    assert_eq!(account.total_amount, dec("1090.40"));
}

#[tokio::test]
async fn test_initiate_funding_requires_active_contract() {
    let h = Harness::new().await;
    h.seed_profiles().await;
    let contract = h.seed_active_fixed_contract(dec("1000")).await;
    ContractQueries::new(&h.db)
        .set_status(&contract.id, ContractStatus::PendingSignatures)
        .await
        .unwrap();

    let err = service(&h)
        .initiate_funding(&contract.id, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::PreconditionFailed { code, .. } if code == codes::CONTRACT_NOT_ACTIVE
    ));
}

#[tokio::test]
async fn test_initiate_funding_requires_worker_payout_account() {
    let h = Harness::new().await;
    let profiles = ProfileQueries::new(&h.db);
    profiles
        .insert(&common::profile(SPONSOR, "Sponsor", None))
        .await
        .unwrap();
    // Worker never started payout onboarding
    profiles
        .insert(&common::profile(WORKER, "Worker", None))
        .await
        .unwrap();
    let contract = h.seed_active_fixed_contract(dec("500")).await;

    let err = service(&h)
        .initiate_funding(&contract.id, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::PreconditionFailed { code, .. } if code == codes::TALENT_PAYOUT_NOT_SETUP
    ));
    // The worker was prompted to finish setup
    assert!(h
        .notifier
        .kinds_for(WORKER)
        .contains(&kind::PAYOUT_SETUP_REQUIRED.to_string()));
}

#[tokio::test]
async fn test_initiate_funding_requires_sponsor_region() {
    let h = Harness::new().await;
    let profiles = ProfileQueries::new(&h.db);
    let mut sponsor = common::profile(SPONSOR, "Sponsor", None);
    sponsor.region = None;
    profiles.insert(&sponsor).await.unwrap();
    profiles
        .insert(&common::profile(WORKER, "Worker", Some("acct_worker")))
        .await
        .unwrap();
    h.gateway.add_ready_account("acct_worker");
    let contract = h.seed_active_fixed_contract(dec("500")).await;

    let err = service(&h)
        .initiate_funding(&contract.id, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::PreconditionFailed { code, .. } if code == codes::LOCATION_REQUIRED
    ));
}

#[tokio::test]
async fn test_hourly_base_amount_falls_back_to_proposal_hours() {
    let h = Harness::new().await;
    h.seed_profiles().await;
    // No estimated hours on the contract; the proposal carries 40
    let contract = h
        .seed_active_hourly_contract(dec("50"), None, None)
        .await;

    let initiation = service(&h)
        .initiate_funding(&contract.id, None)
        .await
        .unwrap();
    assert_eq!(initiation.base_amount, dec("2000"));

    // Explicit request hours win over every fallback
    EscrowQueries::new(&h.db)
        .delete_account(
            &EscrowQueries::new(&h.db)
                .account_by_contract(&contract.id)
                .await
                .unwrap()
                .unwrap()
                .id,
        )
        .await
        .unwrap();
    let initiation = service(&h)
        .initiate_funding(&contract.id, Some(dec("10")))
        .await
        .unwrap();
    assert_eq!(initiation.base_amount, dec("500"));
}

#[tokio::test]
async fn test_stale_unfunded_account_is_replaced() {
    let h = Harness::new().await;
    h.seed_profiles().await;
    let contract = h.seed_active_fixed_contract(dec("1000")).await;
    let escrow = service(&h);

    let first = escrow.initiate_funding(&contract.id, None).await.unwrap();
    let second = escrow.initiate_funding(&contract.id, None).await.unwrap();

    assert!(!second.already_funded);
    assert_ne!(first.payment_handle, second.payment_handle);
    // Only one account remains, bound to the fresh intent
    let account = EscrowQueries::new(&h.db)
        .account_by_contract(&contract.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(format!("{}_secret", account.payment_intent_ref), second.payment_handle);
}

#[tokio::test]
async fn test_concurrent_initiation_never_surfaces_database_error() {
    let h = Harness::new().await;
    h.seed_profiles().await;
    let contract = h.seed_active_fixed_contract(dec("1000")).await;
    let escrow = service(&h);

    // Two sponsors' tabs race to fund the same contract; the loser gets
    // a Conflict (or the documented stale replacement), never Database.
    let (a, b) = tokio::join!(
        escrow.initiate_funding(&contract.id, None),
        escrow.initiate_funding(&contract.id, None),
    );
    for result in [a, b] {
        match result {
            Ok(_) | Err(EngineError::Conflict(_)) => {}
            Err(other) => panic!("unexpected error from racing initiation: {other}"),
        }
    }

    // Exactly one account survives, whichever way the race resolved
    assert!(EscrowQueries::new(&h.db)
        .account_by_contract(&contract.id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_duplicate_account_insert_is_a_unique_violation() {
    let h = Harness::new().await;
    h.seed_profiles().await;
    let contract = h.seed_active_fixed_contract(dec("1000")).await;
    let escrow = service(&h);
    escrow.initiate_funding(&contract.id, None).await.unwrap();

    // A second row for the same contract trips UNIQUE(contract_id) and is
    // recognizable as such, which is what lets the service report Conflict
    let queries = EscrowQueries::new(&h.db);
    let existing = queries
        .account_by_contract(&contract.id)
        .await
        .unwrap()
        .unwrap();
    let mut duplicate = existing.clone();
    duplicate.id = "escrow-dup".into();
    duplicate.payment_intent_ref = "pi_dup".into();
    let err = queries.insert_account(&duplicate).await.unwrap_err();
    assert!(is_unique_violation(&err));
}

#[tokio::test]
async fn test_confirm_funding_is_idempotent() {
    let h = Harness::new().await;
    h.seed_profiles().await;
    let contract = h.seed_active_fixed_contract(dec("1000")).await;
    let escrow = service(&h);

    escrow.initiate_funding(&contract.id, None).await.unwrap();
    let funded = escrow
        .confirm_funding(&contract.id, "pi_gateway_ref")
        .await
        .unwrap();
    assert_eq!(funded.status, EscrowStatus::Funded);
    assert!(funded.funded_at.is_some());

    // Second confirmation is a no-op: still funded, no duplicate notifications
    let again = escrow
        .confirm_funding(&contract.id, "pi_gateway_ref")
        .await
        .unwrap();
    assert_eq!(again.status, EscrowStatus::Funded);
    let funded_notices = h
        .notifier
        .kinds_for(WORKER)
        .iter()
        .filter(|k| *k == kind::ESCROW_FUNDED)
        .count();
    assert_eq!(funded_notices, 1);
    assert_eq!(h.notifier.emails.lock().unwrap().len(), 1);

    // The funding ledger entry completed exactly once
    let queries = EscrowQueries::new(&h.db);
    let account = queries
        .account_by_contract(&contract.id)
        .await
        .unwrap()
        .unwrap();
    let funded_total = queries
        .completed_total(&account.id, TxnType::Funding)
        .await
        .unwrap();
    assert_eq!(funded_total, dec("1090.40"));
}

#[tokio::test]
async fn test_initiate_after_funding_returns_existing_idempotently() {
    let h = Harness::new().await;
    h.seed_profiles().await;
    let contract = h.seed_active_fixed_contract(dec("1000")).await;
    let escrow = service(&h);

    let first = escrow.initiate_funding(&contract.id, None).await.unwrap();
    escrow
        .confirm_funding(&contract.id, "pi_ref")
        .await
        .unwrap();

    let repeat = escrow.initiate_funding(&contract.id, None).await.unwrap();
    assert!(repeat.already_funded);
    assert_eq!(repeat.total_amount, first.total_amount);
    // No second payment intent was created for it
    assert_eq!(h.gateway.intents.lock().unwrap().len(), 1);
}
