//! HTTP implementation of the payment gateway
//!
//! Talks to the processor's REST API with form-encoded requests and a
//! bearer secret key. Monetary amounts cross the wire in minor units
//! (cents); everything inside the engine stays `Decimal`.

use super::{
    ConnectAccount, GatewayError, GatewayEvent, PaymentGateway, PaymentIntent, PayoutMethod,
    WebhookVerifier,
};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Payment gateway over the processor's REST API
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
    verifier: WebhookVerifier,
}

impl HttpGateway {
    /// Create a gateway client
    pub fn new(base_url: impl Into<String>, secret_key: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
            verifier: WebhookVerifier::new(webhook_secret),
        }
    }

    async fn post_form(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<serde_json::Value, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Gateway POST {}", path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.secret_key)
            .form(form)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Self::decode_response(response).await
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Gateway GET {}", path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.secret_key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Self::decode_response(response).await
    }

    async fn decode_response(response: reqwest::Response) -> Result<serde_json::Value, GatewayError> {
        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        if status.is_success() {
            return Ok(body);
        }

        let code = body
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let message = body
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown gateway error")
            .to_string();
        error!("Gateway API error {}: {} ({})", status, message, code);

        if code == "balance_insufficient" {
            return Err(GatewayError::InsufficientBalance(message));
        }
        Err(GatewayError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

/// Convert a decimal major-unit amount to integer minor units (cents).
fn to_minor_units(amount: Decimal) -> Result<i64, GatewayError> {
    (amount * Decimal::from(100))
        .round()
        .to_i64()
        .ok_or_else(|| GatewayError::Decode(format!("amount {} out of range", amount)))
}

fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

fn metadata_form(metadata: &HashMap<String, String>) -> Vec<(String, String)> {
    metadata
        .iter()
        .map(|(k, v)| (format!("metadata[{}]", k), v.clone()))
        .collect()
}

#[derive(Deserialize)]
struct RawIntent {
    id: String,
    client_secret: String,
    amount: i64,
    currency: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct RawAccount {
    id: String,
    #[serde(default)]
    payouts_enabled: bool,
    #[serde(default)]
    details_submitted: bool,
}

fn decode<T: serde::de::DeserializeOwned>(body: serde_json::Value) -> Result<T, GatewayError> {
    serde_json::from_value(body).map_err(|e| GatewayError::Decode(e.to_string()))
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_payment_intent(
        &self,
        amount: Decimal,
        currency: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<PaymentIntent, GatewayError> {
        let mut form = vec![
            ("amount".to_string(), to_minor_units(amount)?.to_string()),
            ("currency".to_string(), currency.to_string()),
        ];
        form.extend(metadata_form(metadata));

        let raw: RawIntent = decode(self.post_form("/v1/payment_intents", &form).await?)?;
        Ok(PaymentIntent {
            intent_ref: raw.id,
            client_secret: raw.client_secret,
            amount: from_minor_units(raw.amount),
            currency: raw.currency,
            metadata: raw.metadata,
        })
    }

    async fn get_payment_intent(&self, intent_ref: &str) -> Result<PaymentIntent, GatewayError> {
        let raw: RawIntent = decode(self.get(&format!("/v1/payment_intents/{}", intent_ref)).await?)?;
        Ok(PaymentIntent {
            intent_ref: raw.id,
            client_secret: raw.client_secret,
            amount: from_minor_units(raw.amount),
            currency: raw.currency,
            metadata: raw.metadata,
        })
    }

    async fn create_connect_account(&self, email: &str) -> Result<ConnectAccount, GatewayError> {
        let form = vec![
            ("type".to_string(), "express".to_string()),
            ("email".to_string(), email.to_string()),
        ];
        let raw: RawAccount = decode(self.post_form("/v1/accounts", &form).await?)?;
        Ok(ConnectAccount {
            account_ref: raw.id,
            payouts_enabled: raw.payouts_enabled,
            details_submitted: raw.details_submitted,
        })
    }

    async fn get_connect_account(&self, account_ref: &str) -> Result<ConnectAccount, GatewayError> {
        let raw: RawAccount = decode(self.get(&format!("/v1/accounts/{}", account_ref)).await?)?;
        Ok(ConnectAccount {
            account_ref: raw.id,
            payouts_enabled: raw.payouts_enabled,
            details_submitted: raw.details_submitted,
        })
    }

    async fn create_account_link(
        &self,
        account_ref: &str,
        refresh_url: &str,
        return_url: &str,
    ) -> Result<String, GatewayError> {
        let form = vec![
            ("account".to_string(), account_ref.to_string()),
            ("refresh_url".to_string(), refresh_url.to_string()),
            ("return_url".to_string(), return_url.to_string()),
            ("type".to_string(), "account_onboarding".to_string()),
        ];
        let body = self.post_form("/v1/account_links", &form).await?;
        body.get("url")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| GatewayError::Decode("account link response missing url".into()))
    }

    async fn transfer_to_destination(
        &self,
        amount: Decimal,
        currency: &str,
        destination: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String, GatewayError> {
        let mut form = vec![
            ("amount".to_string(), to_minor_units(amount)?.to_string()),
            ("currency".to_string(), currency.to_string()),
            ("destination".to_string(), destination.to_string()),
        ];
        form.extend(metadata_form(metadata));

        let body = self.post_form("/v1/transfers", &form).await?;
        body.get("id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| GatewayError::Decode("transfer response missing id".into()))
    }

    async fn get_available_balance(&self, currency: &str) -> Result<Decimal, GatewayError> {
        let body = self.get("/v1/balance").await?;
        let available = body
            .get("available")
            .and_then(|v| v.as_array())
            .ok_or_else(|| GatewayError::Decode("balance response missing available".into()))?;
        let entry = available
            .iter()
            .find(|e| e.get("currency").and_then(|c| c.as_str()) == Some(currency));
        let minor = entry
            .and_then(|e| e.get("amount"))
            .and_then(|a| a.as_i64())
            .unwrap_or(0);
        Ok(from_minor_units(minor))
    }

    async fn create_payout(
        &self,
        amount: Decimal,
        currency: &str,
        method: PayoutMethod,
        account_ref: &str,
    ) -> Result<String, GatewayError> {
        let method = match method {
            PayoutMethod::Standard => "standard",
            PayoutMethod::Instant => "instant",
        };
        let form = vec![
            ("amount".to_string(), to_minor_units(amount)?.to_string()),
            ("currency".to_string(), currency.to_string()),
            ("method".to_string(), method.to_string()),
            // Executed on behalf of the connected account
            ("stripe_account".to_string(), account_ref.to_string()),
        ];
        let body = self.post_form("/v1/payouts", &form).await?;
        body.get("id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| GatewayError::Decode("payout response missing id".into()))
    }

    fn verify_webhook_signature(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<GatewayEvent, GatewayError> {
        self.verifier.verify(payload, signature_header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minor_unit_conversion() {
        assert_eq!(to_minor_units("1090.40".parse().unwrap()).unwrap(), 109040);
        assert_eq!(to_minor_units("0.01".parse().unwrap()).unwrap(), 1);
        assert_eq!(from_minor_units(90960), "909.60".parse::<Decimal>().unwrap());
    }

    #[test]
    fn test_metadata_form_encoding() {
        let mut metadata = HashMap::new();
        metadata.insert("contract_id".to_string(), "c-1".to_string());
        let form = metadata_form(&metadata);
        assert_eq!(form, vec![("metadata[contract_id]".to_string(), "c-1".to_string())]);
    }
}
