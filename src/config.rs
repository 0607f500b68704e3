//! Configuration management for the escrow engine
//!
//! Configuration is loaded from TOML files, with environment variables
//! able to override the gateway secrets.
//!
//! # Example Configuration File
//!
//! ```toml
//! environment = "production"
//!
//! [database]
//! url = "sqlite:/var/lib/escrow-engine/engine.db"
//!
//! [gateway]
//! api_base = "https://api.stripe.com"
//! secret_key = "sk_live_..."
//! webhook_secret = "whsec_..."
//! currency = "cad"
//!
//! [payouts]
//! refresh_url = "https://app.example.com/payouts/refresh"
//! return_url = "https://app.example.com/payouts/return"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Deployment environment.
///
/// Gates the insufficient-balance transfer fallback: synthetic transfer
/// references are only ever substituted outside `Production`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
    #[default]
    Development,
    Test,
}

impl Environment {
    /// Whether this is the production environment
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Deployment environment
    #[serde(default)]
    pub environment: Environment,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Payment gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Payout onboarding link configuration
    #[serde(default)]
    pub payouts: PayoutConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:data/escrow-engine.db".to_string()
}

/// Payment gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the processor's REST API
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Secret API key
    #[serde(default)]
    pub secret_key: String,
    /// Webhook signing secret
    #[serde(default)]
    pub webhook_secret: String,
    /// Settlement currency (ISO 4217, lowercase)
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            secret_key: String::new(),
            webhook_secret: String::new(),
            currency: default_currency(),
        }
    }
}

fn default_api_base() -> String {
    "https://api.stripe.com".to_string()
}

fn default_currency() -> String {
    "cad".to_string()
}

/// URLs handed to the gateway when building payout onboarding links
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PayoutConfig {
    /// Where the gateway sends the worker if the onboarding link expires
    #[serde(default)]
    pub refresh_url: String,
    /// Where the gateway sends the worker after onboarding
    #[serde(default)]
    pub return_url: String,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Let environment variables override gateway secrets
    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("ESCROW_GATEWAY_SECRET_KEY") {
            self.gateway.secret_key = key;
        }
        if let Ok(secret) = std::env::var("ESCROW_GATEWAY_WEBHOOK_SECRET") {
            self.gateway.webhook_secret = secret;
        }
    }

    /// Resolve the database URL
    pub fn resolve_database_url(&self) -> String {
        self.database.url.clone()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.gateway.currency.len() != 3 {
            return Err(format!(
                "Invalid currency code: {}. Must be a 3-letter ISO 4217 code",
                self.gateway.currency
            ));
        }

        if self.environment.is_production() {
            if self.gateway.secret_key.is_empty() {
                return Err("gateway.secret_key is required in production".to_string());
            }
            if self.gateway.webhook_secret.is_empty() {
                return Err("gateway.webhook_secret is required in production".to_string());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate_outside_production() {
        let config = Config::default();
        assert_eq!(config.environment, Environment::Development);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_production_requires_secrets() {
        let mut config = Config {
            environment: Environment::Production,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        config.gateway.secret_key = "sk_live_x".to_string();
        config.gateway.webhook_secret = "whsec_x".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            environment = "staging"

            [gateway]
            secret_key = "sk_test_123"
            currency = "cad"
            "#,
        )
        .unwrap();
        assert_eq!(config.environment, Environment::Staging);
        assert_eq!(config.gateway.secret_key, "sk_test_123");
        assert!(!config.environment.is_production());
    }

    #[test]
    fn test_invalid_currency_rejected() {
        let mut config = Config::default();
        config.gateway.currency = "dollars".to_string();
        assert!(config.validate().is_err());
    }
}
