//! Contract state machine
//!
//! `DRAFT -> PENDING_SIGNATURES -> ACTIVE -> COMPLETED`, with `CANCELLED`
//! reachable from any non-terminal state. Status is derived from the two
//! signature timestamps, never set directly by callers: the contract is
//! active exactly when both parties have signed.

use crate::db::{
    ContractModel, ContractQueries, ContractStatus, Database, Party, ProfileModel, ProfileQueries,
};
use crate::gateway::PaymentGateway;
use crate::notify::{kind, Notifications};
use crate::{codes, EngineError, EngineResult};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

/// Governs the contract signature lifecycle
pub struct ContractService {
    db: Arc<Database>,
    gateway: Arc<dyn PaymentGateway>,
    notifications: Notifications,
}

impl ContractService {
    /// Create the service
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn PaymentGateway>,
        notifications: Notifications,
    ) -> Self {
        Self {
            db,
            gateway,
            notifications,
        }
    }

    /// Record a party's signature on a contract.
    ///
    /// Workers must have a complete mailing address on file before they
    /// can sign. When the second signature lands the contract activates,
    /// both parties are notified, and a worker without a payout account
    /// gets a setup prompt.
    pub async fn sign(&self, contract_id: &str, party: Party) -> EngineResult<ContractModel> {
        let contracts = ContractQueries::new(&self.db);
        let contract = contracts
            .get(contract_id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| EngineError::NotFound(format!("contract {}", contract_id)))?;

        match contract.status {
            ContractStatus::Completed | ContractStatus::Cancelled => {
                return Err(EngineError::Conflict(format!(
                    "contract {} is {} and can no longer be signed",
                    contract_id, contract.status
                )));
            }
            _ => {}
        }

        if contract.signature_of(party).is_some() {
            return Err(EngineError::Conflict(format!(
                "{:?} has already signed contract {}",
                party, contract_id
            )));
        }

        if party == Party::Worker {
            let profile = self.load_profile(&contract.worker_id).await?;
            if !profile.has_complete_address() {
                return Err(EngineError::precondition(
                    codes::ADDRESS_REQUIRED,
                    "worker must have a complete mailing address (street, city, region, postal code) before signing",
                ));
            }
        }

        let now = Utc::now();
        contracts
            .record_signature(contract_id, party, now)
            .await
            .map_err(EngineError::database)?;

        // Re-read before deciding: a concurrent signer may have landed
        // between our snapshot and this write. The activation decision
        // keys off the persisted timestamps, never the stale snapshot.
        let contract = contracts
            .get(contract_id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| EngineError::NotFound(format!("contract {}", contract_id)))?;

        if contract.sponsor_signed_at.is_some() && contract.worker_signed_at.is_some() {
            if contract.status != ContractStatus::Active {
                contracts
                    .activate(contract_id, now)
                    .await
                    .map_err(EngineError::database)?;
                info!("Contract {} fully signed and activated", contract_id);
                self.send_activation_notifications(&contract).await;
            }
        } else if contract.status == ContractStatus::Draft {
            contracts
                .set_status(contract_id, ContractStatus::PendingSignatures)
                .await
                .map_err(EngineError::database)?;
        }

        contracts
            .get(contract_id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| EngineError::NotFound(format!("contract {}", contract_id)))
    }

    async fn send_activation_notifications(&self, contract: &ContractModel) {
        let data = serde_json::json!({ "contract_id": contract.id });
        for user_id in [&contract.sponsor_id, &contract.worker_id] {
            self.notifications
                .notify(
                    user_id,
                    kind::CONTRACT_ACTIVATED,
                    "Contract activated",
                    "Both parties have signed; the contract is now active.",
                    data.clone(),
                )
                .await;
        }

        // Prompt the worker to set up payouts if the gateway doesn't know them yet
        let needs_payout_setup = match self.load_profile(&contract.worker_id).await {
            Ok(profile) => match profile.gateway_account_id {
                None => true,
                Some(ref account_ref) => self
                    .gateway
                    .get_connect_account(account_ref)
                    .await
                    .map(|a| !a.is_payout_ready())
                    .unwrap_or(true),
            },
            Err(_) => false,
        };
        if needs_payout_setup {
            self.notifications
                .notify(
                    &contract.worker_id,
                    kind::PAYOUT_SETUP_REQUIRED,
                    "Set up your payout account",
                    "Set up a payout account to receive payments for this contract.",
                    data,
                )
                .await;
        }
    }

    async fn load_profile(&self, user_id: &str) -> EngineResult<ProfileModel> {
        ProfileQueries::new(&self.db)
            .get(user_id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| EngineError::NotFound(format!("profile {}", user_id)))
    }
}
