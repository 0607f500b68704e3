//! Escrow and milestone settlement engine for a contract work marketplace.
//!
//! The engine owns the money-movement core: contract signature lifecycle,
//! escrow funding with platform fee and jurisdictional tax, milestone and
//! deliverable review, milestone payment release, biweekly hourly
//! settlement, and webhook reconciliation against the payment gateway.
//!
//! # Architecture
//!
//! All financial state lives in the local SQLite ledger; the external
//! payment processor is reached only through the [`gateway::PaymentGateway`]
//! trait, so every service can be exercised against a test double:
//!
//! 1. [`contract::ContractService`] drives signatures and activation
//! 2. [`escrow::EscrowService`] creates and funds the escrow account
//! 3. [`milestone::MilestoneService`] reviews deliverables and releases payments
//! 4. [`hourly::HourlyService`] settles biweekly pay periods
//! 5. [`reconcile::Reconciler`] replays signed webhook events into the ledger
//!
#![warn(missing_docs)]

pub mod config;
pub mod contract;
pub mod db;
pub mod escrow;
pub mod fees;
pub mod gateway;
pub mod hourly;
pub mod milestone;
pub mod notify;
pub mod reconcile;
pub mod settlement;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

pub use config::Config;
use contract::ContractService;
use db::{Database, ProfileQueries};
use escrow::EscrowService;
use gateway::{HttpGateway, PaymentGateway};
use hourly::HourlyService;
use milestone::MilestoneService;
use notify::{Notifications, Notifier};
use reconcile::Reconciler;
use settlement::TransferExecutor;

/// Machine-readable precondition codes surfaced to API clients
pub mod codes {
    /// Sponsor has no province/region on file, taxes cannot be computed
    pub const LOCATION_REQUIRED: &str = "LOCATION_REQUIRED";
    /// Worker must have a complete mailing address before signing
    pub const ADDRESS_REQUIRED: &str = "ADDRESS_REQUIRED";
    /// Worker has not started payout account setup
    pub const TALENT_PAYOUT_NOT_SETUP: &str = "TALENT_PAYOUT_NOT_SETUP";
    /// Worker's payout account exists but is not active yet
    pub const TALENT_PAYOUT_NOT_ACTIVE: &str = "TALENT_PAYOUT_NOT_ACTIVE";
    /// Operation requires a fully signed, active contract
    pub const CONTRACT_NOT_ACTIVE: &str = "CONTRACT_NOT_ACTIVE";
    /// Milestone must be approved before its payment can be released
    pub const MILESTONE_NOT_APPROVED: &str = "MILESTONE_NOT_APPROVED";
}

/// Error taxonomy for engine operations
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// The request itself is malformed or incoherent
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The request is well-formed but a required state is missing; carries
    /// a machine-readable code from [`codes`]
    #[error("Precondition failed ({code}): {message}")]
    PreconditionFailed {
        /// Machine-readable code for clients
        code: &'static str,
        /// Human-readable explanation
        message: String,
    },

    /// The operation conflicts with the resource's current state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The caller is not the right party for this operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The referenced resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Authenticity could not be established (bad webhook signature)
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// The payment gateway failed or rejected the request
    #[error("Upstream gateway failure: {0}")]
    Upstream(String),

    /// Local ledger failure
    #[error("Database error: {0}")]
    Database(String),
}

impl EngineError {
    /// Wrap a storage-layer error
    pub fn database(err: impl std::fmt::Display) -> Self {
        EngineError::Database(err.to_string())
    }

    /// A precondition failure with its machine-readable code
    pub fn precondition(code: &'static str, message: impl Into<String>) -> Self {
        EngineError::PreconditionFailed {
            code,
            message: message.into(),
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// The assembled settlement engine
#[derive(Clone)]
pub struct EscrowEngine {
    /// Engine configuration
    pub config: Arc<Config>,
    /// Ledger database
    pub db: Arc<Database>,
    /// Contract signature lifecycle
    pub contracts: Arc<ContractService>,
    /// Escrow creation and funding
    pub escrow: Arc<EscrowService>,
    /// Milestone review and payment release
    pub milestones: Arc<MilestoneService>,
    /// Biweekly hourly settlement
    pub hourly: Arc<HourlyService>,
    /// Webhook reconciliation
    pub reconciler: Arc<Reconciler>,
    gateway: Arc<dyn PaymentGateway>,
}

impl EscrowEngine {
    /// Create an engine backed by the HTTP gateway named in the config
    pub async fn new(config: Config, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let gateway: Arc<dyn PaymentGateway> = Arc::new(HttpGateway::new(
            config.gateway.api_base.clone(),
            config.gateway.secret_key.clone(),
            config.gateway.webhook_secret.clone(),
        ));
        Self::with_gateway(config, gateway, notifier).await
    }

    /// Create an engine with an injected gateway implementation
    pub async fn with_gateway(
        config: Config,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate().map_err(EngineError::InvalidArgument)?;
        let config = Arc::new(config);

        let db_url = config.resolve_database_url();
        info!("Connecting to database at: {}", db_url);
        let db = Arc::new(Database::connect(&db_url).await?);

        let notifications = Notifications::new(notifier);
        let transfers = TransferExecutor::new(
            gateway.clone(),
            config.environment,
            config.gateway.currency.clone(),
        );

        let contracts = Arc::new(ContractService::new(
            db.clone(),
            gateway.clone(),
            notifications.clone(),
        ));
        let escrow = Arc::new(EscrowService::new(
            db.clone(),
            gateway.clone(),
            notifications.clone(),
            config.gateway.currency.clone(),
        ));
        let milestones = Arc::new(MilestoneService::new(
            db.clone(),
            gateway.clone(),
            notifications.clone(),
            transfers.clone(),
        ));
        let hourly = Arc::new(HourlyService::new(
            db.clone(),
            gateway.clone(),
            notifications.clone(),
            transfers,
        ));
        let reconciler = Arc::new(Reconciler::new(
            db.clone(),
            gateway.clone(),
            notifications.clone(),
        ));

        info!("Escrow engine initialized");
        Ok(Self {
            config,
            db,
            contracts,
            escrow,
            milestones,
            hourly,
            reconciler,
            gateway,
        })
    }

    /// Ensure the user has a connected payout account and return a fresh
    /// onboarding link for it.
    ///
    /// Creates the gateway account on first call and stores its reference
    /// on the profile; subsequent calls reuse the stored account.
    pub async fn ensure_payout_account(&self, user_id: &str) -> EngineResult<String> {
        let profiles = ProfileQueries::new(&self.db);
        let profile = profiles
            .get(user_id)
            .await
            .map_err(EngineError::database)?
            .ok_or_else(|| EngineError::NotFound(format!("profile {}", user_id)))?;

        let account_ref = match profile.gateway_account_id {
            Some(account_ref) => account_ref,
            None => {
                let account = self
                    .gateway
                    .create_connect_account(&profile.email)
                    .await
                    .map_err(|e| EngineError::Upstream(e.to_string()))?;
                profiles
                    .set_gateway_account(user_id, &account.account_ref)
                    .await
                    .map_err(EngineError::database)?;
                info!(
                    "Created payout account {} for user {}",
                    account.account_ref, user_id
                );
                account.account_ref
            }
        };

        self.gateway
            .create_account_link(
                &account_ref,
                &self.config.payouts.refresh_url,
                &self.config.payouts.return_url,
            )
            .await
            .map_err(|e| EngineError::Upstream(e.to_string()))
    }

    /// Shut down the engine, closing the ledger connection
    pub async fn shutdown(&self) {
        info!("Shutting down escrow engine");
        self.db.close().await;
    }
}
