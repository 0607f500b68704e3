//! Transfer execution with the environment-gated test-mode fallback
//!
//! All settlement paths (milestone release, hourly period payment) funnel
//! gateway transfers through [`TransferExecutor`] so the simulation branch
//! lives in exactly one place. In non-production environments a transfer
//! that fails for insufficient simulated balance is downgraded to a
//! synthetic reference so sandbox balance limits do not block development
//! flows. That substitution never happens in production.

use crate::config::Environment;
use crate::gateway::{GatewayError, PaymentGateway};
use crate::{EngineError, EngineResult};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Result of an executed (or simulated) transfer
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// Gateway transfer reference, synthetic when simulated
    pub transfer_ref: String,
    /// True when the test-mode fallback substituted a synthetic reference
    pub simulated: bool,
}

/// Executes gateway transfers on behalf of the settlement services
#[derive(Clone)]
pub struct TransferExecutor {
    gateway: Arc<dyn PaymentGateway>,
    environment: Environment,
    currency: String,
}

impl TransferExecutor {
    /// Create an executor bound to an environment and settlement currency
    pub fn new(gateway: Arc<dyn PaymentGateway>, environment: Environment, currency: String) -> Self {
        Self {
            gateway,
            environment,
            currency,
        }
    }

    /// Transfer `amount` to a worker's connected account.
    ///
    /// Insufficient-balance failures become synthetic successes outside
    /// production; every other gateway error propagates as `Upstream`.
    pub async fn transfer(
        &self,
        amount: Decimal,
        destination: &str,
        metadata: &HashMap<String, String>,
    ) -> EngineResult<TransferOutcome> {
        match self
            .gateway
            .transfer_to_destination(amount, &self.currency, destination, metadata)
            .await
        {
            Ok(transfer_ref) => {
                info!("Transfer {} of {} {} to {}", transfer_ref, amount, self.currency, destination);
                Ok(TransferOutcome {
                    transfer_ref,
                    simulated: false,
                })
            }
            Err(GatewayError::InsufficientBalance(msg)) if !self.environment.is_production() => {
                let transfer_ref = format!("tr_sim_{}", Uuid::new_v4().simple());
                warn!(
                    "Insufficient simulated balance ({}); substituting synthetic transfer {} for {} {}",
                    msg, transfer_ref, amount, self.currency
                );
                Ok(TransferOutcome {
                    transfer_ref,
                    simulated: true,
                })
            }
            Err(e) => Err(EngineError::Upstream(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ConnectAccount, GatewayEvent, PaymentIntent, PayoutMethod};
    use async_trait::async_trait;

    struct FailingGateway {
        error: fn() -> GatewayError,
    }

    #[async_trait]
    impl PaymentGateway for FailingGateway {
        async fn create_payment_intent(
            &self,
            _amount: Decimal,
            _currency: &str,
            _metadata: &HashMap<String, String>,
        ) -> Result<PaymentIntent, GatewayError> {
            unimplemented!()
        }

        async fn get_payment_intent(&self, _intent_ref: &str) -> Result<PaymentIntent, GatewayError> {
            unimplemented!()
        }

        async fn create_connect_account(&self, _email: &str) -> Result<ConnectAccount, GatewayError> {
            unimplemented!()
        }

        async fn get_connect_account(&self, _account_ref: &str) -> Result<ConnectAccount, GatewayError> {
            unimplemented!()
        }

        async fn create_account_link(
            &self,
            _account_ref: &str,
            _refresh_url: &str,
            _return_url: &str,
        ) -> Result<String, GatewayError> {
            unimplemented!()
        }

        async fn transfer_to_destination(
            &self,
            _amount: Decimal,
            _currency: &str,
            _destination: &str,
            _metadata: &HashMap<String, String>,
        ) -> Result<String, GatewayError> {
            Err((self.error)())
        }

        async fn get_available_balance(&self, _currency: &str) -> Result<Decimal, GatewayError> {
            unimplemented!()
        }

        async fn create_payout(
            &self,
            _amount: Decimal,
            _currency: &str,
            _method: PayoutMethod,
            _account_ref: &str,
        ) -> Result<String, GatewayError> {
            unimplemented!()
        }

        fn verify_webhook_signature(
            &self,
            _payload: &[u8],
            _signature_header: &str,
        ) -> Result<GatewayEvent, GatewayError> {
            unimplemented!()
        }
    }

    fn executor(environment: Environment, error: fn() -> GatewayError) -> TransferExecutor {
        TransferExecutor::new(
            Arc::new(FailingGateway { error }),
            environment,
            "cad".to_string(),
        )
    }

    #[tokio::test]
    async fn test_insufficient_balance_simulated_outside_production() {
        let executor = executor(Environment::Development, || {
            GatewayError::InsufficientBalance("sandbox balance too low".into())
        });
        let outcome = executor
            .transfer("100".parse().unwrap(), "acct_1", &HashMap::new())
            .await
            .unwrap();
        assert!(outcome.simulated);
        assert!(outcome.transfer_ref.starts_with("tr_sim_"));
    }

    #[tokio::test]
    async fn test_insufficient_balance_fails_in_production() {
        let executor = executor(Environment::Production, || {
            GatewayError::InsufficientBalance("balance too low".into())
        });
        let result = executor
            .transfer("100".parse().unwrap(), "acct_1", &HashMap::new())
            .await;
        assert!(matches!(result, Err(EngineError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_other_gateway_errors_propagate_everywhere() {
        let executor = executor(Environment::Development, || GatewayError::Api {
            status: 500,
            message: "boom".into(),
        });
        let result = executor
            .transfer("100".parse().unwrap(), "acct_1", &HashMap::new())
            .await;
        assert!(matches!(result, Err(EngineError::Upstream(_))));
    }
}
