//! Escrow account management
//!
//! Creates and funds the escrow backing an active contract. This module
//! is the only path that may create an `EscrowAccount`, and (together
//! with the webhook reconciler, which shares [`apply_funding_success`])
//! the only code that moves one to `FUNDED`.

use crate::db::{
    is_unique_violation, ContractKind, ContractModel, ContractQueries, Database, EscrowAccountModel,
    EscrowQueries, EscrowStatus, EscrowTransactionModel, ProfileModel, ProfileQueries,
    ProjectQueries, TxnStatus, TxnType,
};
use crate::fees::{self, FeeBreakdown};
use crate::gateway::{ConnectAccount, PaymentGateway};
use crate::notify::{kind, Notifications};
use crate::{codes, EngineError, EngineResult};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Result of initiating escrow funding, handed back to the client
#[derive(Debug, Clone, serde::Serialize)]
pub struct FundingInitiation {
    /// Client-usable handle for completing the payment
    pub payment_handle: String,
    /// Contract amount the escrow covers
    pub base_amount: Decimal,
    /// Sponsor-side fee/tax breakdown for display
    pub fees: FeeBreakdown,
    /// base + fee + tax: the amount to collect
    pub total_amount: Decimal,
    /// True when the escrow was already funded and nothing was re-created
    pub already_funded: bool,
}

/// Manages escrow creation and funding against a contract
pub struct EscrowService {
    db: Arc<Database>,
    gateway: Arc<dyn PaymentGateway>,
    notifications: Notifications,
    currency: String,
}

impl EscrowService {
    /// Create the service
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn PaymentGateway>,
        notifications: Notifications,
        currency: String,
    ) -> Self {
        Self {
            db,
            gateway,
            notifications,
            currency,
        }
    }

    /// Initiate escrow funding for an active contract.
    ///
    /// Computes the escrow target (base amount plus sponsor-side fee and
    /// tax), creates a gateway payment intent, and persists the account
    /// with its pending funding transaction. Idempotent against an
    /// already-funded escrow; a stale unfunded account is deleted and
    /// recreated with a fresh intent.
    pub async fn initiate_funding(
        &self,
        contract_id: &str,
        estimated_hours: Option<Decimal>,
    ) -> EngineResult<FundingInitiation> {
        let contract = self.load_active_contract(contract_id).await?;
        let base_amount = self.resolve_base_amount(&contract, estimated_hours).await?;

        let profiles = ProfileQueries::new(&self.db);
        let sponsor = profiles
            .get(&contract.sponsor_id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| EngineError::NotFound(format!("profile {}", contract.sponsor_id)))?;
        let jurisdiction = sponsor.jurisdiction().ok_or_else(|| {
            EngineError::precondition(
                codes::LOCATION_REQUIRED,
                "sponsor province/region is required to compute taxes",
            )
        })?;

        // Funding is pointless if the worker can never be paid out; check
        // up front and prompt them to finish setup.
        require_payout_ready(
            &self.db,
            self.gateway.as_ref(),
            Some(&self.notifications),
            &contract.worker_id,
        )
        .await?;

        let breakdown = fees::compute_fee(base_amount, jurisdiction, sponsor.tax_exempt);
        let total_amount = base_amount + breakdown.total_fee;

        let escrow = EscrowQueries::new(&self.db);
        if let Some(existing) = escrow
            .account_by_contract(contract_id)
            .await
            .map_err(EngineError::database)?
        {
            if matches!(
                existing.status,
                EscrowStatus::Funded | EscrowStatus::PartiallyReleased | EscrowStatus::Released
            ) {
                info!("Escrow for contract {} already funded; returning idempotently", contract_id);
                return Ok(FundingInitiation {
                    payment_handle: existing.payment_intent_ref,
                    base_amount: existing.base_amount,
                    fees: FeeBreakdown {
                        base_fee: existing.fee_amount,
                        tax_amount: existing.tax_amount,
                        total_fee: existing.fee_amount + existing.tax_amount,
                        exempt: existing.tax_amount.is_zero(),
                    },
                    total_amount: existing.total_amount,
                    already_funded: true,
                });
            }
            // Stale unfunded attempt: discard and retry with a fresh intent
            warn!(
                "Replacing stale escrow account {} ({}) for contract {}",
                existing.id, existing.status, contract_id
            );
            escrow
                .delete_account(&existing.id)
                .await
                .map_err(EngineError::database)?;
        }

        let mut metadata = HashMap::new();
        metadata.insert("contract_id".to_string(), contract_id.to_string());
        metadata.insert("purpose".to_string(), "escrow_funding".to_string());
        let intent = self
            .gateway
            .create_payment_intent(total_amount, &self.currency, &metadata)
            .await
            .map_err(|e| EngineError::Upstream(e.to_string()))?;

        let now = Utc::now();
        let account = EscrowAccountModel {
            id: Uuid::new_v4().to_string(),
            contract_id: contract_id.to_string(),
            base_amount,
            fee_amount: breakdown.base_fee,
            tax_amount: breakdown.tax_amount,
            total_amount,
            payment_intent_ref: intent.intent_ref.clone(),
            status: EscrowStatus::PendingFunding,
            funded_at: None,
            created_at: now,
            updated_at: now,
        };
        // UNIQUE(contract_id) catches the concurrent-initiation race
        if let Err(e) = escrow.insert_account(&account).await {
            if is_unique_violation(&e) {
                return Err(EngineError::Conflict(format!(
                    "escrow funding for contract {} is already in progress",
                    contract_id
                )));
            }
            return Err(EngineError::database(e));
        }
        escrow
            .insert_transaction(&EscrowTransactionModel {
                id: Uuid::new_v4().to_string(),
                escrow_account_id: account.id.clone(),
                txn_type: TxnType::Funding,
                amount: total_amount,
                status: TxnStatus::Pending,
                gateway_ref: Some(intent.intent_ref),
                created_at: now,
                updated_at: now,
            })
            .await
            .map_err(EngineError::database)?;

        info!(
            "Initiated escrow funding for contract {}: base={}, fee={}, tax={}, total={}",
            contract_id, base_amount, breakdown.base_fee, breakdown.tax_amount, total_amount
        );

        Ok(FundingInitiation {
            payment_handle: intent.client_secret,
            base_amount,
            fees: breakdown,
            total_amount,
            already_funded: false,
        })
    }

    /// Synchronous funding confirmation, for clients that observe gateway
    /// success directly instead of waiting for the webhook. Idempotent.
    pub async fn confirm_funding(
        &self,
        contract_id: &str,
        gateway_ref: &str,
    ) -> EngineResult<EscrowAccountModel> {
        let escrow = EscrowQueries::new(&self.db);
        let account = escrow
            .account_by_contract(contract_id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| {
                EngineError::NotFound(format!("escrow account for contract {}", contract_id))
            })?;

        let contract = ContractQueries::new(&self.db)
            .get(contract_id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| EngineError::NotFound(format!("contract {}", contract_id)))?;

        apply_funding_success(
            &self.db,
            &self.notifications,
            &account,
            &contract.worker_id,
            Some(gateway_ref),
        )
        .await?;

        escrow
            .account_by_contract(contract_id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| {
                EngineError::NotFound(format!("escrow account for contract {}", contract_id))
            })
    }

    async fn load_active_contract(&self, contract_id: &str) -> EngineResult<ContractModel> {
        let contract = ContractQueries::new(&self.db)
            .get(contract_id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| EngineError::NotFound(format!("contract {}", contract_id)))?;

        if contract.status != crate::db::ContractStatus::Active
            || contract.sponsor_signed_at.is_none()
            || contract.worker_signed_at.is_none()
        {
            return Err(EngineError::precondition(
                codes::CONTRACT_NOT_ACTIVE,
                "escrow funding requires an active, fully signed contract",
            ));
        }
        Ok(contract)
    }

    /// Base escrow amount: the fixed total, or rate x estimated hours with
    /// the hours sourced from the request, then the contract, then the
    /// originating proposal.
    async fn resolve_base_amount(
        &self,
        contract: &ContractModel,
        requested_hours: Option<Decimal>,
    ) -> EngineResult<Decimal> {
        match contract.kind {
            ContractKind::Fixed => contract.total_amount.ok_or_else(|| {
                EngineError::InvalidArgument("fixed-price contract has no total amount".into())
            }),
            ContractKind::Hourly => {
                let rate = contract.hourly_rate.ok_or_else(|| {
                    EngineError::InvalidArgument("hourly contract has no hourly rate".into())
                })?;
                let hours = match requested_hours.or(contract.estimated_hours) {
                    Some(h) => Some(h),
                    None => ProjectQueries::new(&self.db)
                        .get_proposal(&contract.proposal_id)
                        .await
                        .map_err(EngineError::database)?
                        .and_then(|p| p.estimated_hours),
                };
                match hours {
                    Some(h) if h > Decimal::ZERO => Ok(rate * h),
                    Some(_) => Err(EngineError::InvalidArgument(
                        "estimated hours must be a positive number".into(),
                    )),
                    None => Err(EngineError::InvalidArgument(
                        "estimated hours are required to fund an hourly contract".into(),
                    )),
                }
            }
        }
    }
}

/// Shared funded transition.
///
/// Used by both the synchronous confirmation path and the webhook
/// reconciler; the guarded UPDATE underneath makes the race between them
/// safe. Returns true if this caller performed the transition, false if
/// the account was already funded (no-op, no duplicate notifications).
pub(crate) async fn apply_funding_success(
    db: &Database,
    notifications: &Notifications,
    account: &EscrowAccountModel,
    worker_id: &str,
    gateway_ref: Option<&str>,
) -> EngineResult<bool> {
    let escrow = EscrowQueries::new(db);
    let transitioned = escrow
        .mark_funded_if_pending(&account.id, gateway_ref, Utc::now())
        .await
        .map_err(EngineError::database)?;

    if !transitioned {
        info!("Escrow account {} already funded; skipping", account.id);
        return Ok(false);
    }

    info!(
        "Escrow account {} funded ({} for contract {})",
        account.id, account.total_amount, account.contract_id
    );

    let data = serde_json::json!({
        "contract_id": account.contract_id,
        "amount": account.total_amount,
    });
    notifications
        .notify(
            worker_id,
            kind::ESCROW_FUNDED,
            "Escrow funded",
            "The sponsor has funded escrow for your contract. You can start working.",
            data.clone(),
        )
        .await;
    if let Ok(Some(worker)) = ProfileQueries::new(db).get(worker_id).await {
        notifications
            .send_email("escrow_funded", &worker.email, data)
            .await;
    }

    Ok(true)
}

/// Require the worker to have an active, payout-capable gateway account.
///
/// Returns the worker profile and connected account. When `notifications`
/// is provided, a missing or incomplete setup also prompts the worker.
pub(crate) async fn require_payout_ready(
    db: &Database,
    gateway: &dyn PaymentGateway,
    notifications: Option<&Notifications>,
    worker_id: &str,
) -> EngineResult<(ProfileModel, ConnectAccount)> {
    let profile = ProfileQueries::new(db)
        .get(worker_id)
        .await
        .map_err(EngineError::database)?
        .ok_or_else(|| EngineError::NotFound(format!("profile {}", worker_id)))?;

    let account_ref = match profile.gateway_account_id.as_deref() {
        Some(r) => r,
        None => {
            prompt_payout_setup(notifications, worker_id).await;
            return Err(EngineError::precondition(
                codes::TALENT_PAYOUT_NOT_SETUP,
                "talent must complete payout account setup",
            ));
        }
    };

    let account = gateway
        .get_connect_account(account_ref)
        .await
        .map_err(|e| EngineError::Upstream(e.to_string()))?;
    if !account.is_payout_ready() {
        prompt_payout_setup(notifications, worker_id).await;
        return Err(EngineError::precondition(
            codes::TALENT_PAYOUT_NOT_ACTIVE,
            "talent payout account is not yet active",
        ));
    }

    Ok((profile, account))
}

async fn prompt_payout_setup(notifications: Option<&Notifications>, worker_id: &str) {
    if let Some(notifications) = notifications {
        notifications
            .notify(
                worker_id,
                kind::PAYOUT_SETUP_REQUIRED,
                "Set up your payout account",
                "Complete payout account setup to receive payments.",
                serde_json::json!({}),
            )
            .await;
    }
}
