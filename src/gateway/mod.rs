//! Payment gateway boundary
//!
//! Everything the engine needs from the external payment processor,
//! expressed as a narrow typed interface: payment intents for escrow
//! funding, connected payout accounts for workers, transfers for
//! settlement, and signed webhook events. All state lives in the local
//! ledger; the gateway is stateless from the engine's point of view.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

mod http;
mod webhook;

pub use http::HttpGateway;
pub use webhook::WebhookVerifier;

/// Errors from the payment gateway
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    /// The source balance cannot cover the transfer. Distinguished from
    /// other API errors because non-production environments downgrade it
    /// to a synthetic transfer.
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    /// The processor rejected the request
    #[error("gateway API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure (timeout, connection refused)
    #[error("gateway transport error: {0}")]
    Transport(String),

    /// Webhook signature could not be verified
    #[error("webhook signature invalid: {0}")]
    Signature(String),

    /// Response could not be decoded
    #[error("gateway response decode error: {0}")]
    Decode(String),
}

/// A payment intent created to collect escrow funds from the sponsor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Processor reference (e.g. `pi_...`)
    pub intent_ref: String,
    /// Client-usable handle for completing the payment
    pub client_secret: String,
    pub amount: Decimal,
    pub currency: String,
    /// Metadata attached at creation (contract id etc.)
    pub metadata: HashMap<String, String>,
}

/// A connected payout account belonging to a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAccount {
    /// Processor reference (e.g. `acct_...`)
    pub account_ref: String,
    /// Whether the processor will execute payouts to this account
    pub payouts_enabled: bool,
    /// Whether onboarding details have been submitted
    pub details_submitted: bool,
}

impl ConnectAccount {
    /// An account is payout-capable once onboarding is done and payouts
    /// are enabled.
    pub fn is_payout_ready(&self) -> bool {
        self.payouts_enabled && self.details_submitted
    }
}

/// Payout method for [`PaymentGateway::create_payout`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutMethod {
    Standard,
    Instant,
}

/// A webhook event, decoded after signature verification
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// `payment_intent.succeeded`
    PaymentIntentSucceeded {
        intent_ref: String,
        metadata: HashMap<String, String>,
    },
    /// `payment_intent.payment_failed`
    PaymentIntentFailed {
        intent_ref: String,
        failure_message: Option<String>,
    },
    /// `account.updated` on a connected payout account
    AccountUpdated {
        account_ref: String,
        payouts_enabled: bool,
    },
    /// Any event type the engine does not act on
    Other { event_type: String },
}

/// Typed interface over the external payment processor.
///
/// Injected into every service at construction so tests can substitute a
/// double; no global client instance exists anywhere in the engine.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a payment intent to collect `amount` from the sponsor
    async fn create_payment_intent(
        &self,
        amount: Decimal,
        currency: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<PaymentIntent, GatewayError>;

    /// Fetch an existing payment intent (secondary webhook lookup)
    async fn get_payment_intent(&self, intent_ref: &str) -> Result<PaymentIntent, GatewayError>;

    /// Create a connected payout account for a worker
    async fn create_connect_account(&self, email: &str) -> Result<ConnectAccount, GatewayError>;

    /// Fetch a connected payout account
    async fn get_connect_account(&self, account_ref: &str) -> Result<ConnectAccount, GatewayError>;

    /// Create an onboarding link for a connected account
    async fn create_account_link(
        &self,
        account_ref: &str,
        refresh_url: &str,
        return_url: &str,
    ) -> Result<String, GatewayError>;

    /// Transfer `amount` to a connected account; returns the transfer ref
    async fn transfer_to_destination(
        &self,
        amount: Decimal,
        currency: &str,
        destination: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String, GatewayError>;

    /// Available platform balance for a currency
    async fn get_available_balance(&self, currency: &str) -> Result<Decimal, GatewayError>;

    /// Create a payout from a connected account to its bank; returns the payout ref
    async fn create_payout(
        &self,
        amount: Decimal,
        currency: &str,
        method: PayoutMethod,
        account_ref: &str,
    ) -> Result<String, GatewayError>;

    /// Verify a webhook payload's authenticity and decode the event
    fn verify_webhook_signature(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<GatewayEvent, GatewayError>;
}
