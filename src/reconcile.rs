//! Webhook reconciliation
//!
//! Verifies signed gateway events and replays them against the local
//! ledger. Funding success is applied through the same guarded transition
//! as the synchronous confirmation path, so replayed or racing events are
//! no-ops rather than double-applications.

use crate::db::{Database, EscrowQueries, ProfileQueries};
use crate::escrow::apply_funding_success;
use crate::gateway::{GatewayEvent, PaymentGateway};
use crate::notify::{kind, Notifications};
use crate::{EngineError, EngineResult};
use std::sync::Arc;
use tracing::{info, warn};

/// What the reconciler did with a verified event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Funding success applied to the named escrow account
    FundingApplied { escrow_account_id: String },
    /// Event was valid but the ledger was already up to date
    AlreadyApplied,
    /// Funding failure recorded for the named escrow account
    FundingFailed { escrow_account_id: String },
    /// Payout account became ready; worker notified
    PayoutAccountReady { user_id: String },
    /// Verified event the engine does not act on
    Ignored { reason: String },
}

/// Applies verified gateway webhook events to the ledger
pub struct Reconciler {
    db: Arc<Database>,
    gateway: Arc<dyn PaymentGateway>,
    notifications: Notifications,
}

impl Reconciler {
    /// Create the reconciler
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

    /// Verify and apply a raw webhook delivery.
    ///
    /// A bad or stale signature is `Unauthenticated`; the payload is not
    /// parsed before verification succeeds.
    pub async fn handle_gateway_event(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> EngineResult<ReconcileOutcome> {
        let event = self
            .gateway
            .verify_webhook_signature(payload, signature_header)
            .map_err(|e| EngineError::Unauthenticated(e.to_string()))?;

        match event {
            GatewayEvent::PaymentIntentSucceeded {
                intent_ref,
                metadata,
            } => self.apply_intent_succeeded(&intent_ref, &metadata).await,
            GatewayEvent::PaymentIntentFailed {
                intent_ref,
                failure_message,
            } => self.apply_intent_failed(&intent_ref, failure_message).await,
            GatewayEvent::AccountUpdated {
                account_ref,
                payouts_enabled,
            } => self.apply_account_updated(&account_ref, payouts_enabled).await,
            GatewayEvent::Other { event_type } => {
                info!("Ignoring gateway event type {}", event_type);
                Ok(ReconcileOutcome::Ignored { reason: event_type })
            }
        }
    }

    async fn apply_intent_succeeded(
        &self,
        intent_ref: &str,
        metadata: &std::collections::HashMap<String, String>,
    ) -> EngineResult<ReconcileOutcome> {
        let escrow = EscrowQueries::new(&self.db);
        let mut account = escrow
            .account_by_intent(intent_ref)
            .await
            .map_err(EngineError::database)?;

        // The account may have been recreated with a fresh intent since
        // this event was emitted; fall back to the contract id the intent
        // was created with.
        if account.is_none() {
            let contract_id = match metadata.get("contract_id").cloned() {
                Some(id) => Some(id),
                None => self
                    .gateway
                    .get_payment_intent(intent_ref)
                    .await
                    .ok()
                    .and_then(|i| i.metadata.get("contract_id").cloned()),
            };
            if let Some(contract_id) = contract_id {
                account = escrow
                    .account_by_contract(&contract_id)
                    .await
                    .map_err(EngineError::database)?;
            }
        }

        let account = match account {
            Some(a) => a,
            None => {
                warn!(
                    "payment_intent.succeeded for {} matched no escrow account",
                    intent_ref
                );
                return Ok(ReconcileOutcome::Ignored {
                    reason: format!("no escrow account for intent {}", intent_ref),
                });
            }
        };

        let contract = crate::db::ContractQueries::new(&self.db)
            .get(&account.contract_id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| {
                EngineError::NotFound(format!("contract {}", account.contract_id))
            })?;

        let applied = apply_funding_success(
            &self.db,
            &self.notifications,
            &account,
            &contract.worker_id,
            Some(intent_ref),
        )
        .await?;

        if applied {
            Ok(ReconcileOutcome::FundingApplied {
                escrow_account_id: account.id,
            })
        } else {
            Ok(ReconcileOutcome::AlreadyApplied)
        }
    }

    async fn apply_intent_failed(
        &self,
        intent_ref: &str,
        failure_message: Option<String>,
    ) -> EngineResult<ReconcileOutcome> {
        let escrow = EscrowQueries::new(&self.db);
        let account = match escrow
            .account_by_intent(intent_ref)
            .await
            .map_err(EngineError::database)?
        {
            Some(a) => a,
            None => {
                return Ok(ReconcileOutcome::Ignored {
                    reason: format!("no escrow account for intent {}", intent_ref),
                })
            }
        };

        let transitioned = escrow
            .mark_funding_failed(&account.id)
            .await
            .map_err(EngineError::database)?;
        if !transitioned {
            // Already funded or already failed; a replayed failure event
            // must not mask the persisted status.
            info!(
                "Escrow account {} not pending; ignoring funding failure event",
                account.id
            );
            return Ok(ReconcileOutcome::AlreadyApplied);
        }

        warn!(
            "Escrow funding failed for account {} (contract {}): {}",
            account.id,
            account.contract_id,
            failure_message.as_deref().unwrap_or("no failure message")
        );

        Ok(ReconcileOutcome::FundingFailed {
            escrow_account_id: account.id,
        })
    }

    async fn apply_account_updated(
        &self,
        account_ref: &str,
        payouts_enabled: bool,
    ) -> EngineResult<ReconcileOutcome> {
        if !payouts_enabled {
            return Ok(ReconcileOutcome::Ignored {
                reason: format!("account {} payouts not enabled", account_ref),
            });
        }

        let profile = match ProfileQueries::new(&self.db)
            .get_by_gateway_account(account_ref)
            .await
            .map_err(EngineError::database)?
        {
            Some(p) => p,
            None => {
                return Ok(ReconcileOutcome::Ignored {
                    reason: format!("no profile for gateway account {}", account_ref),
                })
            }
        };

        info!(
            "Payout account {} active for user {}",
            account_ref, profile.id
        );
        self.notifications
            .notify(
                &profile.id,
                kind::PAYOUT_READY,
                "Payout account active",
                "Your payout account is set up. You can now receive payments.",
                serde_json::json!({ "gateway_account_id": account_ref }),
            )
            .await;

        Ok(ReconcileOutcome::PayoutAccountReady {
            user_id: profile.id,
        })
    }
}
