//! Milestone and deliverable workflow
//!
//! Submission and review of deliverables and milestones, plus settlement
//! of an approved milestone. Status rollups (all deliverables approved ->
//! milestone approved; all milestones settled -> contract and project
//! completed) live in single functions invoked after every state change
//! rather than being re-derived at each call site.

use crate::db::{
    is_unique_violation, ContractModel, ContractQueries, ContractStatus, Database,
    DeliverableStatus, EscrowQueries, EscrowStatus, EscrowTransactionModel, MilestoneModel,
    MilestoneQueries, MilestoneStatus, PaymentModel, PaymentQueries, PaymentStatus,
    ProjectQueries, ProjectStatus, TxnStatus, TxnType,
};
use crate::escrow::require_payout_ready;
use crate::fees;
use crate::gateway::PaymentGateway;
use crate::notify::{kind, Notifications};
use crate::settlement::TransferExecutor;
use crate::{EngineError, EngineResult};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Review decision for a submitted deliverable
#[derive(Debug, Clone)]
pub enum ReviewAction {
    Approve,
    Reject { reason: String },
}

/// Manages deliverable/milestone review and milestone settlement
pub struct MilestoneService {
    db: Arc<Database>,
    gateway: Arc<dyn PaymentGateway>,
    notifications: Notifications,
    transfers: TransferExecutor,
}

impl MilestoneService {
    /// Create the service
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn PaymentGateway>,
        notifications: Notifications,
        transfers: TransferExecutor,
    ) -> Self {
        Self {
            db,
            gateway,
            notifications,
            transfers,
        }
    }

    /// Submit a deliverable for review. Worker only; allowed from pending
    /// or rejected (rework) states.
    pub async fn submit_deliverable(
        &self,
        deliverable_id: &str,
        actor_id: &str,
    ) -> EngineResult<()> {
        let milestones = MilestoneQueries::new(&self.db);
        let deliverable = milestones
            .get_deliverable(deliverable_id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| EngineError::NotFound(format!("deliverable {}", deliverable_id)))?;
        let contract = self.contract_of_milestone(&deliverable.milestone_id).await?;

        if actor_id != contract.worker_id {
            return Err(EngineError::Forbidden(
                "only the contract's worker may submit deliverables".into(),
            ));
        }
        match deliverable.status {
            DeliverableStatus::Pending | DeliverableStatus::Rejected => {}
            other => {
                return Err(EngineError::Conflict(format!(
                    "deliverable {} is {} and cannot be submitted",
                    deliverable_id, other
                )));
            }
        }

        milestones
            .mark_deliverable_submitted(deliverable_id, Utc::now())
            .await
            .map_err(EngineError::database)
    }

    /// Submit a milestone for review. Worker only; allowed from pending or
    /// rejected states.
    pub async fn submit_milestone(&self, milestone_id: &str, actor_id: &str) -> EngineResult<()> {
        let milestones = MilestoneQueries::new(&self.db);
        let milestone = self.load_milestone(milestone_id).await?;
        let contract = self.load_contract(&milestone.contract_id).await?;

        if actor_id != contract.worker_id {
            return Err(EngineError::Forbidden(
                "only the contract's worker may submit milestones".into(),
            ));
        }
        match milestone.status {
            MilestoneStatus::Pending | MilestoneStatus::Rejected => {}
            other => {
                return Err(EngineError::Conflict(format!(
                    "milestone {} is {} and cannot be submitted",
                    milestone_id, other
                )));
            }
        }

        milestones
            .mark_submitted(milestone_id, Utc::now())
            .await
            .map_err(EngineError::database)
    }

    /// Review a submitted deliverable. Sponsor only; rejection requires a
    /// reason. Approving the last outstanding deliverable rolls the
    /// milestone up to approved.
    pub async fn review_deliverable(
        &self,
        deliverable_id: &str,
        actor_id: &str,
        action: ReviewAction,
    ) -> EngineResult<()> {
        let milestones = MilestoneQueries::new(&self.db);
        let deliverable = milestones
            .get_deliverable(deliverable_id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| EngineError::NotFound(format!("deliverable {}", deliverable_id)))?;
        let contract = self.contract_of_milestone(&deliverable.milestone_id).await?;

        if actor_id != contract.sponsor_id {
            return Err(EngineError::Forbidden(
                "only the contract's sponsor may review deliverables".into(),
            ));
        }
        if deliverable.status != DeliverableStatus::Submitted {
            return Err(EngineError::Conflict(format!(
                "deliverable {} is {} and cannot be reviewed",
                deliverable_id, deliverable.status
            )));
        }

        let now = Utc::now();
        match action {
            ReviewAction::Approve => {
                milestones
                    .mark_deliverable_reviewed(deliverable_id, DeliverableStatus::Approved, None, now)
                    .await
                    .map_err(EngineError::database)?;
                self.rollup_milestone(&deliverable.milestone_id).await?;
            }
            ReviewAction::Reject { reason } => {
                let reason = reason.trim().to_string();
                if reason.is_empty() {
                    return Err(EngineError::InvalidArgument(
                        "a rejection reason is required".into(),
                    ));
                }
                milestones
                    .mark_deliverable_reviewed(
                        deliverable_id,
                        DeliverableStatus::Rejected,
                        Some(&reason),
                        now,
                    )
                    .await
                    .map_err(EngineError::database)?;
            }
        }
        Ok(())
    }

    /// Milestone approval rollup: a milestone with at least one deliverable
    /// auto-approves once every deliverable is approved. Invoked after
    /// every deliverable state change.
    pub async fn rollup_milestone(&self, milestone_id: &str) -> EngineResult<bool> {
        let milestones = MilestoneQueries::new(&self.db);
        let milestone = self.load_milestone(milestone_id).await?;
        if milestone.status == MilestoneStatus::Approved {
            return Ok(false);
        }

        let total = milestones
            .deliverable_count(milestone_id)
            .await
            .map_err(EngineError::database)?;
        let unapproved = milestones
            .unapproved_deliverables(milestone_id)
            .await
            .map_err(EngineError::database)?;
        if total == 0 || unapproved > 0 {
            return Ok(false);
        }

        milestones
            .mark_reviewed(milestone_id, MilestoneStatus::Approved, None, Utc::now())
            .await
            .map_err(EngineError::database)?;
        info!("Milestone {} auto-approved: all deliverables approved", milestone_id);
        Ok(true)
    }

    /// Release payment for an approved milestone. Sponsor only.
    ///
    /// Creates the payment record first, so the one-live-payment-per-milestone
    /// constraint turns a concurrent double release into a `Conflict` before
    /// any money moves. Then executes the transfer, records the release in
    /// the escrow ledger, and completes the contract and project when this
    /// was the last outstanding milestone.
    pub async fn release_milestone_payment(
        &self,
        milestone_id: &str,
        actor_id: &str,
    ) -> EngineResult<PaymentModel> {
        let milestone = self.load_milestone(milestone_id).await?;
        let contract = self.load_contract(&milestone.contract_id).await?;

        if actor_id != contract.sponsor_id {
            return Err(EngineError::Forbidden(
                "only the contract's sponsor may release milestone payments".into(),
            ));
        }

        let milestones = MilestoneQueries::new(&self.db);
        let unapproved = milestones
            .unapproved_deliverables(milestone_id)
            .await
            .map_err(EngineError::database)?;
        let releasable = match milestone.status {
            MilestoneStatus::Approved => unapproved == 0,
            // Entry point used before the rollup ran: acceptable when every
            // deliverable is already approved.
            MilestoneStatus::Submitted => unapproved == 0,
            _ => false,
        };
        if !releasable {
            return Err(EngineError::precondition(
                crate::codes::MILESTONE_NOT_APPROVED,
                "milestone must be approved with all deliverables approved before release",
            ));
        }

        let (worker, payout_account) =
            require_payout_ready(&self.db, self.gateway.as_ref(), None, &contract.worker_id).await?;

        // Worker-side fee, in the worker's jurisdiction
        let jurisdiction = worker.jurisdiction().unwrap_or_default().to_string();
        let breakdown = fees::compute_fee(milestone.amount, &jurisdiction, worker.tax_exempt);
        let net_amount = milestone.amount - breakdown.total_fee;

        let escrow = EscrowQueries::new(&self.db);
        let account = escrow
            .account_by_contract(&contract.id)
            .await
            .map_err(EngineError::database)?;
        if let Some(ref account) = account {
            // Ledger invariant: completed releases never exceed completed funding
            let funded = escrow
                .completed_total(&account.id, TxnType::Funding)
                .await
                .map_err(EngineError::database)?;
            let released = escrow
                .completed_total(&account.id, TxnType::Release)
                .await
                .map_err(EngineError::database)?;
            if released + net_amount > funded {
                return Err(EngineError::Conflict(format!(
                    "release of {} would exceed escrowed funds ({} funded, {} already released)",
                    net_amount, funded, released
                )));
            }
        }

        let now = Utc::now();
        let payment = PaymentModel {
            id: Uuid::new_v4().to_string(),
            contract_id: contract.id.clone(),
            milestone_id: Some(milestone_id.to_string()),
            payer_id: contract.sponsor_id.clone(),
            payee_id: contract.worker_id.clone(),
            amount: milestone.amount,
            platform_fee: breakdown.total_fee,
            net_amount,
            status: PaymentStatus::Processing,
            transfer_ref: None,
            created_at: now,
            completed_at: None,
        };
        let payments = PaymentQueries::new(&self.db);
        if let Err(e) = payments.insert(&payment).await {
            if is_unique_violation(&e) {
                return Err(EngineError::Conflict(format!(
                    "a payment for milestone {} already exists",
                    milestone_id
                )));
            }
            return Err(EngineError::database(e));
        }

        let mut metadata = HashMap::new();
        metadata.insert("contract_id".to_string(), contract.id.clone());
        metadata.insert("milestone_id".to_string(), milestone_id.to_string());
        let outcome = match self
            .transfers
            .transfer(net_amount, &payout_account.account_ref, &metadata)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Milestone {} transfer failed: {}", milestone_id, e);
                payments
                    .mark_failed(&payment.id)
                    .await
                    .map_err(EngineError::database)?;
                return Err(e);
            }
        };

        payments
            .mark_completed(&payment.id, &outcome.transfer_ref, Utc::now())
            .await
            .map_err(EngineError::database)?;
        if milestone.status != MilestoneStatus::Approved {
            milestones
                .mark_reviewed(milestone_id, MilestoneStatus::Approved, None, Utc::now())
                .await
                .map_err(EngineError::database)?;
        }

        if let Some(account) = account {
            escrow
                .insert_transaction(&EscrowTransactionModel {
                    id: Uuid::new_v4().to_string(),
                    escrow_account_id: account.id.clone(),
                    txn_type: TxnType::Release,
                    amount: net_amount,
                    status: TxnStatus::Completed,
                    gateway_ref: Some(outcome.transfer_ref.clone()),
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                })
                .await
                .map_err(EngineError::database)?;

            let remaining = milestones
                .unreleased_count(&contract.id)
                .await
                .map_err(EngineError::database)?;
            let status = if remaining == 0 {
                EscrowStatus::Released
            } else {
                EscrowStatus::PartiallyReleased
            };
            escrow
                .set_account_status(&account.id, status)
                .await
                .map_err(EngineError::database)?;
        }

        info!(
            "Released milestone {}: gross={}, fee={}, net={} (transfer {})",
            milestone_id, milestone.amount, breakdown.total_fee, net_amount, outcome.transfer_ref
        );

        self.notifications
            .notify(
                &contract.worker_id,
                kind::PAYMENT_RECEIVED,
                "Payment received",
                "A milestone payment has been released to your payout account.",
                serde_json::json!({
                    "milestone_id": milestone_id,
                    "net_amount": net_amount,
                }),
            )
            .await;

        self.rollup_contract_completion(&contract).await?;

        payments
            .get(&payment.id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| EngineError::NotFound(format!("payment {}", payment.id)))
    }

    /// Completion rollup: once every milestone has a completed payment,
    /// the contract and its project both complete.
    async fn rollup_contract_completion(&self, contract: &ContractModel) -> EngineResult<()> {
        let remaining = MilestoneQueries::new(&self.db)
            .unreleased_count(&contract.id)
            .await
            .map_err(EngineError::database)?;
        if remaining > 0 {
            return Ok(());
        }

        ContractQueries::new(&self.db)
            .set_status(&contract.id, ContractStatus::Completed)
            .await
            .map_err(EngineError::database)?;
        ProjectQueries::new(&self.db)
            .update_status(&contract.project_id, ProjectStatus::Completed)
            .await
            .map_err(EngineError::database)?;
        info!(
            "Contract {} and project {} completed: all milestones settled",
            contract.id, contract.project_id
        );
        Ok(())
    }

    async fn load_milestone(&self, milestone_id: &str) -> EngineResult<MilestoneModel> {
        MilestoneQueries::new(&self.db)
            .get(milestone_id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| EngineError::NotFound(format!("milestone {}", milestone_id)))
    }

    async fn load_contract(&self, contract_id: &str) -> EngineResult<ContractModel> {
        ContractQueries::new(&self.db)
            .get(contract_id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| EngineError::NotFound(format!("contract {}", contract_id)))
    }

    async fn contract_of_milestone(&self, milestone_id: &str) -> EngineResult<ContractModel> {
        let milestone = self.load_milestone(milestone_id).await?;
        self.load_contract(&milestone.contract_id).await
    }
}
