//! Notification and email collaborator boundary
//!
//! The engine only ever *triggers* notifications; composing their content
//! and delivering them is someone else's job. Both calls are
//! fire-and-forget: a failed notification is logged and must never fail
//! or roll back the financial operation that triggered it.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Notification kinds the engine emits
pub mod kind {
    pub const CONTRACT_ACTIVATED: &str = "contract_activated";
    pub const PAYOUT_SETUP_REQUIRED: &str = "payout_setup_required";
    pub const PAYOUT_READY: &str = "payout_ready";
    pub const ESCROW_FUNDED: &str = "escrow_funded";
    pub const PAYMENT_RECEIVED: &str = "payment_received";
}

/// External notification/email capability
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver an in-app notification
    async fn notify(
        &self,
        user_id: &str,
        kind: &str,
        title: &str,
        message: &str,
        data: Value,
    ) -> anyhow::Result<()>;

    /// Send a templated email
    async fn send_email(&self, template: &str, recipient: &str, data: Value) -> anyhow::Result<()>;
}

/// Fire-and-forget wrapper around a [`Notifier`].
///
/// Every engine service goes through this; delivery errors are swallowed
/// after logging so settlement state never depends on the notification
/// pipeline.
#[derive(Clone)]
pub struct Notifications {
    inner: Arc<dyn Notifier>,
}

impl Notifications {
    /// Wrap a notifier implementation
    pub fn new(inner: Arc<dyn Notifier>) -> Self {
        Self { inner }
    }

    /// Trigger an in-app notification, logging (not propagating) failures
    pub async fn notify(&self, user_id: &str, kind: &str, title: &str, message: &str, data: Value) {
        if let Err(e) = self.inner.notify(user_id, kind, title, message, data).await {
            warn!("Notification delivery failed (kind={}, user={}): {}", kind, user_id, e);
        }
    }

    /// Trigger a templated email, logging (not propagating) failures
    pub async fn send_email(&self, template: &str, recipient: &str, data: Value) {
        if let Err(e) = self.inner.send_email(template, recipient, data).await {
            warn!("Email delivery failed (template={}, to={}): {}", template, recipient, e);
        }
    }
}

/// Notifier that only logs, for environments without a delivery pipeline
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(
        &self,
        user_id: &str,
        kind: &str,
        title: &str,
        _message: &str,
        _data: Value,
    ) -> anyhow::Result<()> {
        info!("notify[{}] {}: {}", kind, user_id, title);
        Ok(())
    }

    async fn send_email(&self, template: &str, recipient: &str, _data: Value) -> anyhow::Result<()> {
        info!("email[{}] -> {}", template, recipient);
        Ok(())
    }
}
