//! Shared test doubles and fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use escrow_engine::config::Environment;
use escrow_engine::db::{
    ContractKind, ContractModel, ContractQueries, ContractStatus, Database, DeliverableModel,
    DeliverableStatus, MilestoneModel, MilestoneQueries, MilestoneStatus, ProfileModel,
    ProfileQueries, ProjectModel, ProjectQueries, ProjectStatus, ProposalModel, TimeEntryModel,
    TimeEntryQueries, TimeEntryStatus,
};
use escrow_engine::gateway::{
    ConnectAccount, GatewayError, GatewayEvent, PaymentGateway, PaymentIntent, PayoutMethod,
    WebhookVerifier,
};
use escrow_engine::notify::{Notifications, Notifier};
use escrow_engine::settlement::TransferExecutor;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const WEBHOOK_SECRET: &str = "whsec_test";
pub const SPONSOR: &str = "sponsor-1";
pub const WORKER: &str = "worker-1";

/// In-memory gateway double.
///
/// Hands out sequential `pi_`/`acct_`/`tr_` references, remembers what it
/// created, and can be primed to fail the next transfer.
pub struct MockGateway {
    verifier: WebhookVerifier,
    counter: AtomicU64,
    pub intents: Mutex<HashMap<String, PaymentIntent>>,
    pub accounts: Mutex<HashMap<String, ConnectAccount>>,
    pub transfers: Mutex<Vec<(Decimal, String)>>,
    transfer_error: Mutex<Option<GatewayError>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            verifier: WebhookVerifier::new(WEBHOOK_SECRET),
            counter: AtomicU64::new(0),
            intents: Mutex::new(HashMap::new()),
            accounts: Mutex::new(HashMap::new()),
            transfers: Mutex::new(Vec::new()),
            transfer_error: Mutex::new(None),
        }
    }

    fn next(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Register a payout-ready connected account
    pub fn add_ready_account(&self, account_ref: &str) {
        self.accounts.lock().unwrap().insert(
            account_ref.to_string(),
            ConnectAccount {
                account_ref: account_ref.to_string(),
                payouts_enabled: true,
                details_submitted: true,
            },
        );
    }

    /// Register an account still mid-onboarding
    pub fn add_incomplete_account(&self, account_ref: &str) {
        self.accounts.lock().unwrap().insert(
            account_ref.to_string(),
            ConnectAccount {
                account_ref: account_ref.to_string(),
                payouts_enabled: false,
                details_submitted: false,
            },
        );
    }

    /// Fail the next transfer with the given error
    pub fn fail_next_transfer(&self, error: GatewayError) {
        *self.transfer_error.lock().unwrap() = Some(error);
    }

    /// Sign a webhook payload the way the processor would
    pub fn sign(&self, payload: &[u8]) -> String {
        self.verifier.sign(payload, Utc::now().timestamp())
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_payment_intent(
        &self,
        amount: Decimal,
        currency: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<PaymentIntent, GatewayError> {
        let intent_ref = self.next("pi");
        let intent = PaymentIntent {
            intent_ref: intent_ref.clone(),
            client_secret: format!("{}_secret", intent_ref),
            amount,
            currency: currency.to_string(),
            metadata: metadata.clone(),
        };
        self.intents
            .lock()
            .unwrap()
            .insert(intent_ref, intent.clone());
        Ok(intent)
    }

    async fn get_payment_intent(&self, intent_ref: &str) -> Result<PaymentIntent, GatewayError> {
        self.intents
            .lock()
            .unwrap()
            .get(intent_ref)
            .cloned()
            .ok_or_else(|| GatewayError::Api {
                status: 404,
                message: format!("no such payment intent: {}", intent_ref),
            })
    }

    async fn create_connect_account(&self, _email: &str) -> Result<ConnectAccount, GatewayError> {
        let account_ref = self.next("acct");
        let account = ConnectAccount {
            account_ref: account_ref.clone(),
            payouts_enabled: false,
            details_submitted: false,
        };
        self.accounts
            .lock()
            .unwrap()
            .insert(account_ref, account.clone());
        Ok(account)
    }

    async fn get_connect_account(&self, account_ref: &str) -> Result<ConnectAccount, GatewayError> {
        self.accounts
            .lock()
            .unwrap()
            .get(account_ref)
            .cloned()
            .ok_or_else(|| GatewayError::Api {
                status: 404,
                message: format!("no such account: {}", account_ref),
            })
    }

    async fn create_account_link(
        &self,
        account_ref: &str,
        _refresh_url: &str,
        _return_url: &str,
    ) -> Result<String, GatewayError> {
        Ok(format!("https://onboard.test/{}", account_ref))
    }

    async fn transfer_to_destination(
        &self,
        amount: Decimal,
        _currency: &str,
        destination: &str,
        _metadata: &HashMap<String, String>,
    ) -> Result<String, GatewayError> {
        if let Some(error) = self.transfer_error.lock().unwrap().take() {
            return Err(error);
        }
        self.transfers
            .lock()
            .unwrap()
            .push((amount, destination.to_string()));
        Ok(self.next("tr"))
    }

    async fn get_available_balance(&self, _currency: &str) -> Result<Decimal, GatewayError> {
        Ok(Decimal::new(1_000_000, 0))
    }

    async fn create_payout(
        &self,
        _amount: Decimal,
        _currency: &str,
        _method: PayoutMethod,
        _account_ref: &str,
    ) -> Result<String, GatewayError> {
        Ok(self.next("po"))
    }

    fn verify_webhook_signature(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<GatewayEvent, GatewayError> {
        self.verifier.verify(payload, signature_header)
    }
}

/// Notifier that records every delivery
#[derive(Default)]
pub struct RecordingNotifier {
    pub notices: Mutex<Vec<(String, String)>>,
    pub emails: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn kinds_for(&self, user_id: &str) -> Vec<String> {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .filter(|(user, _)| user == user_id)
            .map(|(_, kind)| kind.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        user_id: &str,
        kind: &str,
        _title: &str,
        _message: &str,
        _data: Value,
    ) -> anyhow::Result<()> {
        self.notices
            .lock()
            .unwrap()
            .push((user_id.to_string(), kind.to_string()));
        Ok(())
    }

    async fn send_email(&self, template: &str, recipient: &str, _data: Value) -> anyhow::Result<()> {
        self.emails
            .lock()
            .unwrap()
            .push((template.to_string(), recipient.to_string()));
        Ok(())
    }
}

/// Everything a service test needs, wired against the in-memory doubles
pub struct Harness {
    pub db: Arc<Database>,
    pub gateway: Arc<MockGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub notifications: Notifications,
}

impl Harness {
    pub async fn new() -> Self {
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        let gateway = Arc::new(MockGateway::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let notifications = Notifications::new(notifier.clone());
        Self {
            db,
            gateway,
            notifier,
            notifications,
        }
    }

    pub fn transfers(&self, environment: Environment) -> TransferExecutor {
        TransferExecutor::new(self.gateway.clone(), environment, "cad".to_string())
    }

    /// Insert sponsor and worker profiles, both in Ontario with complete
    /// addresses; the worker gets a payout-ready connected account.
    pub async fn seed_profiles(&self) {
        let profiles = ProfileQueries::new(&self.db);
        profiles.insert(&profile(SPONSOR, "Sponsor", None)).await.unwrap();
        profiles
            .insert(&profile(WORKER, "Worker", Some("acct_worker")))
            .await
            .unwrap();
        self.gateway.add_ready_account("acct_worker");
    }

    /// Insert a project, proposal and fully signed active fixed-price
    /// contract for `total`.
    pub async fn seed_active_fixed_contract(&self, total: Decimal) -> ContractModel {
        self.seed_project().await;
        let contract = active_contract(ContractKind::Fixed, Some(total), None, None);
        ContractQueries::new(&self.db).insert(&contract).await.unwrap();
        contract
    }

    /// Insert a project, proposal and fully signed active hourly contract.
    pub async fn seed_active_hourly_contract(
        &self,
        rate: Decimal,
        estimated_hours: Option<Decimal>,
        start_date: Option<chrono::NaiveDate>,
    ) -> ContractModel {
        self.seed_project().await;
        let mut contract = active_contract(ContractKind::Hourly, None, Some(rate), estimated_hours);
        contract.start_date = start_date;
        ContractQueries::new(&self.db).insert(&contract).await.unwrap();
        contract
    }

    async fn seed_project(&self) {
        let projects = ProjectQueries::new(&self.db);
        let now = Utc::now();
        projects
            .insert(&ProjectModel {
                id: "proj-1".into(),
                sponsor_id: SPONSOR.into(),
                title: "Website rebuild".into(),
                status: ProjectStatus::InProgress,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        projects
            .insert_proposal(&ProposalModel {
                id: "prop-1".into(),
                project_id: "proj-1".into(),
                worker_id: WORKER.into(),
                estimated_hours: Some(Decimal::new(40, 0)),
                created_at: now,
            })
            .await
            .unwrap();
    }

    /// Insert a pending milestone on the contract
    pub async fn seed_milestone(&self, contract_id: &str, id: &str, amount: Decimal, sequence: i32) {
        let now = Utc::now();
        MilestoneQueries::new(&self.db)
            .insert(&MilestoneModel {
                id: id.into(),
                contract_id: contract_id.into(),
                title: format!("Milestone {}", sequence),
                amount,
                sequence,
                status: MilestoneStatus::Pending,
                rejection_reason: None,
                submitted_at: None,
                reviewed_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }

    /// Insert a pending deliverable on a milestone
    pub async fn seed_deliverable(&self, milestone_id: &str, id: &str) {
        let now = Utc::now();
        MilestoneQueries::new(&self.db)
            .insert_deliverable(&DeliverableModel {
                id: id.into(),
                milestone_id: milestone_id.into(),
                title: format!("Deliverable {}", id),
                status: DeliverableStatus::Pending,
                rejection_reason: None,
                submitted_at: None,
                reviewed_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }

    /// Insert an approved time entry
    pub async fn seed_approved_time_entry(
        &self,
        contract_id: &str,
        id: &str,
        entry_date: chrono::NaiveDate,
        hours: Decimal,
    ) {
        let now = Utc::now();
        TimeEntryQueries::new(&self.db)
            .insert(&TimeEntryModel {
                id: id.into(),
                contract_id: contract_id.into(),
                entry_date,
                hours,
                description: None,
                status: TimeEntryStatus::Approved,
                paid_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }
}

pub fn profile(id: &str, name: &str, gateway_account_id: Option<&str>) -> ProfileModel {
    ProfileModel {
        id: id.into(),
        display_name: name.into(),
        email: format!("{}@example.com", id),
        street: Some("1 Main St".into()),
        city: Some("Toronto".into()),
        region: Some("ON".into()),
        postal_code: Some("M5V 1A1".into()),
        tax_exempt: false,
        gateway_account_id: gateway_account_id.map(String::from),
        created_at: Utc::now(),
    }
}

fn active_contract(
    kind: ContractKind,
    total_amount: Option<Decimal>,
    hourly_rate: Option<Decimal>,
    estimated_hours: Option<Decimal>,
) -> ContractModel {
    let now = Utc::now();
    ContractModel {
        id: "contract-1".into(),
        project_id: "proj-1".into(),
        proposal_id: "prop-1".into(),
        sponsor_id: SPONSOR.into(),
        worker_id: WORKER.into(),
        kind,
        total_amount,
        hourly_rate,
        estimated_hours,
        start_date: None,
        status: ContractStatus::Active,
        sponsor_signed_at: Some(now),
        worker_signed_at: Some(now),
        signed_at: Some(now),
        created_at: now,
        updated_at: now,
    }
}
