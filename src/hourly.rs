//! Hourly settlement calculation
//!
//! Biweekly pay periods anchored to the contract start date, aggregation
//! of approved time entries, and execution of the period payment. Runs
//! parallel to the milestone workflow for hourly contracts.

use crate::db::{
    ContractKind, ContractModel, ContractQueries, Database, PaymentModel, PaymentQueries,
    PaymentStatus, TimeEntryQueries,
};
use crate::escrow::require_payout_ready;
use crate::fees::{self, FeeBreakdown};
use crate::gateway::PaymentGateway;
use crate::notify::{kind, Notifications};
use crate::settlement::TransferExecutor;
use crate::{EngineError, EngineResult};
use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// A contract's current pay period with its aggregated payable amounts
#[derive(Debug, Clone, serde::Serialize)]
pub struct PeriodSummary {
    /// Zero-based index of the period since the contract start
    pub period_index: i64,
    pub period_start: NaiveDate,
    /// Inclusive end date (end of day)
    pub period_end: NaiveDate,
    /// Sum of approved hours in the period
    pub total_hours: Decimal,
    /// hours x hourly rate
    pub gross_amount: Decimal,
    /// Worker-side fee/tax breakdown
    pub fees: FeeBreakdown,
    /// Net payable to the worker
    pub net_amount: Decimal,
    /// Number of approved entries aggregated
    pub entry_count: usize,
}

/// Amounts to settle for a pay period
#[derive(Debug, Clone)]
pub struct PeriodAmounts {
    pub gross_amount: Decimal,
    pub platform_fee: Decimal,
    pub net_amount: Decimal,
}

impl From<&PeriodSummary> for PeriodAmounts {
    fn from(summary: &PeriodSummary) -> Self {
        Self {
            gross_amount: summary.gross_amount,
            platform_fee: summary.fees.total_fee,
            net_amount: summary.net_amount,
        }
    }
}

/// Biweekly period bounds for a contract anchored at `start_date`.
///
/// Period index is `floor(floor(days/7) / 2)`; each period spans 14 days,
/// ending inclusively 13 days after its start.
pub fn period_bounds(start_date: NaiveDate, today: NaiveDate) -> (i64, NaiveDate, NaiveDate) {
    let days = (today - start_date).num_days().max(0);
    let index = (days / 7) / 2;
    let period_start = start_date + Duration::days(index * 14);
    let period_end = period_start + Duration::days(13);
    (index, period_start, period_end)
}

/// Computes pay periods and settles hourly work
pub struct HourlyService {
    db: Arc<Database>,
    gateway: Arc<dyn PaymentGateway>,
    notifications: Notifications,
    transfers: TransferExecutor,
}

impl HourlyService {
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

    /// The contract's current pay period, aggregated as of today
    pub async fn current_period(&self, contract_id: &str) -> EngineResult<PeriodSummary> {
        self.period_as_of(contract_id, Utc::now().date_naive()).await
    }

    /// The pay period containing `today`, with approved entries aggregated
    /// and the worker-side fee applied
    pub async fn period_as_of(
        &self,
        contract_id: &str,
        today: NaiveDate,
    ) -> EngineResult<PeriodSummary> {
        let contract = self.load_hourly_contract(contract_id).await?;
        let start_date = contract.start_date.ok_or_else(|| {
            EngineError::InvalidArgument("hourly contract has no start date".into())
        })?;
        let rate = contract.hourly_rate.ok_or_else(|| {
            EngineError::InvalidArgument("hourly contract has no hourly rate".into())
        })?;

        let (period_index, period_start, period_end) = period_bounds(start_date, today);

        let entries = TimeEntryQueries::new(&self.db)
            .list_approved_in_range(contract_id, period_start, period_end)
            .await
            .map_err(EngineError::database)?;
        let total_hours: Decimal = entries.iter().map(|e| e.hours).sum();
        let gross_amount = (total_hours * rate).round_dp(2);

        let worker = crate::db::ProfileQueries::new(&self.db)
            .get(&contract.worker_id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| EngineError::NotFound(format!("profile {}", contract.worker_id)))?;
        let jurisdiction = worker.jurisdiction().unwrap_or_default().to_string();
        let breakdown = fees::compute_fee(gross_amount, &jurisdiction, worker.tax_exempt);
        let net_amount = gross_amount - breakdown.total_fee;

        Ok(PeriodSummary {
            period_index,
            period_start,
            period_end,
            total_hours,
            gross_amount,
            fees: breakdown,
            net_amount,
            entry_count: entries.len(),
        })
    }

    /// Execute the payment for a pay period.
    ///
    /// Transfers the net amount to the worker (with the test-mode
    /// insufficient-balance fallback), records the payment, and moves
    /// every aggregated time entry to paid with a payment timestamp.
    pub async fn process_period_payment(
        &self,
        contract_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
        amounts: PeriodAmounts,
    ) -> EngineResult<PaymentModel> {
        let contract = self.load_hourly_contract(contract_id).await?;
        let (_, payout_account) =
            require_payout_ready(&self.db, self.gateway.as_ref(), None, &contract.worker_id).await?;

        if amounts.net_amount <= Decimal::ZERO {
            return Err(EngineError::InvalidArgument(
                "nothing payable for this period".into(),
            ));
        }

        let now = Utc::now();
        let payment = PaymentModel {
            id: Uuid::new_v4().to_string(),
            contract_id: contract_id.to_string(),
            milestone_id: None,
            payer_id: contract.sponsor_id.clone(),
            payee_id: contract.worker_id.clone(),
            amount: amounts.gross_amount,
            platform_fee: amounts.platform_fee,
            net_amount: amounts.net_amount,
            status: PaymentStatus::Processing,
            transfer_ref: None,
            created_at: now,
            completed_at: None,
        };
        let payments = PaymentQueries::new(&self.db);
        payments
            .insert(&payment)
            .await
            .map_err(EngineError::database)?;

        let mut metadata = HashMap::new();
        metadata.insert("contract_id".to_string(), contract_id.to_string());
        metadata.insert("period_start".to_string(), period_start.to_string());
        metadata.insert("period_end".to_string(), period_end.to_string());
        let outcome = match self
            .transfers
            .transfer(amounts.net_amount, &payout_account.account_ref, &metadata)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Period payment transfer failed for contract {}: {}", contract_id, e);
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

        let paid = TimeEntryQueries::new(&self.db)
            .mark_paid_in_range(contract_id, period_start, period_end, Utc::now())
            .await
            .map_err(EngineError::database)?;
        info!(
            "Processed period payment for contract {} ({} .. {}): net={}, {} entries paid",
            contract_id, period_start, period_end, amounts.net_amount, paid
        );

        self.notifications
            .notify(
                &contract.worker_id,
                kind::PAYMENT_RECEIVED,
                "Payment received",
                "Your pay period payment has been sent to your payout account.",
                serde_json::json!({
                    "contract_id": contract_id,
                    "period_start": period_start,
                    "period_end": period_end,
                    "net_amount": amounts.net_amount,
                }),
            )
            .await;

        payments
            .get(&payment.id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| EngineError::NotFound(format!("payment {}", payment.id)))
    }

    async fn load_hourly_contract(&self, contract_id: &str) -> EngineResult<ContractModel> {
        let contract = ContractQueries::new(&self.db)
            .get(contract_id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| EngineError::NotFound(format!("contract {}", contract_id)))?;
        if contract.kind != ContractKind::Hourly {
            return Err(EngineError::InvalidArgument(format!(
                "contract {} is not an hourly contract",
                contract_id
            )));
        }
        Ok(contract)
    }
}
