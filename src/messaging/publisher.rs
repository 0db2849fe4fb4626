//! Event publishing with persistent delivery and trace propagation
//!
//! The publisher serializes typed payloads, stamps AMQP properties
//! (persistent delivery, content type, sender identity, correlation ID),
//! injects the active trace context into message headers, and waits for
//! broker confirmation. Failures propagate to the caller after a single
//! attempt; retry is a caller concern.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::BasicProperties;
use tracing::debug;

use crate::domain_types::{AgentName, CorrelationId};
use crate::errors::ChimeraError;
use crate::messaging::channel::ChannelManager;
use crate::messaging::envelope::CONTENT_TYPE_JSON;
use crate::telemetry;

/// Channel name reserved for publishing.
const PUBLISHER_CHANNEL: &str = "publisher";

/// Per-publish options beyond the routing key.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Correlation ID carried in the message properties.
    pub correlation_id: Option<CorrelationId>,
    /// Routing key or queue the receiver should reply on.
    pub reply_to: Option<String>,
    /// Extra string headers; trace context is injected on top.
    pub headers: BTreeMap<String, String>,
}

/// Abstract publish surface. Production uses [`EventPublisher`]; tests
/// use an in-memory recorder.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publishes a serialized payload under the routing key.
    async fn publish_raw(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), ChimeraError>;

    /// The publishing agent's identity, stamped as the message app-id.
    fn agent_name(&self) -> &AgentName;
}

/// Broker-backed publisher bound to one exchange.
pub struct EventPublisher {
    channels: Arc<ChannelManager>,
    agent_name: AgentName,
    exchange: String,
}

impl EventPublisher {
    /// Creates the publisher, declaring its exchange and putting the
    /// publisher channel into confirm mode.
    ///
    /// # Errors
    /// Propagates declaration failures.
    pub async fn new(
        channels: Arc<ChannelManager>,
        agent_name: AgentName,
        exchange: impl Into<String>,
    ) -> Result<Self, ChimeraError> {
        let exchange = exchange.into();
        let channel = channels.get(PUBLISHER_CHANNEL).await?;
        channels.declare_exchange(&channel, &exchange).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(Self {
            channels,
            agent_name,
            exchange,
        })
    }

    /// The exchange this publisher routes through.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }
}

fn headers_to_field_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            key.clone().into(),
            AMQPValue::LongString(value.clone().into()),
        );
    }
    table
}

#[async_trait]
impl MessagePublisher for EventPublisher {
    async fn publish_raw(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), ChimeraError> {
        let mut headers = options.headers;
        telemetry::inject_trace_context(&mut headers);

        let timestamp_secs = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0);
        let mut properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type(CONTENT_TYPE_JSON.to_string().into())
            .with_app_id(self.agent_name.as_ref().clone().into())
            .with_timestamp(timestamp_secs)
            .with_headers(headers_to_field_table(&headers));
        if let Some(correlation_id) = &options.correlation_id {
            properties = properties.with_correlation_id(correlation_id.as_str().to_string().into());
        }
        if let Some(reply_to) = &options.reply_to {
            properties = properties.with_reply_to(reply_to.clone().into());
        }

        let channel = self.channels.get(PUBLISHER_CHANNEL).await?;
        let confirmation = channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;

        if let Confirmation::Nack(_) = confirmation {
            return Err(ChimeraError::system(format!(
                "broker rejected publish on '{routing_key}'"
            )));
        }

        debug!(
            exchange = %self.exchange,
            routing_key,
            correlation_id = options.correlation_id.as_ref().map(CorrelationId::as_str),
            "published message"
        );
        Ok(())
    }

    fn agent_name(&self) -> &AgentName {
        &self.agent_name
    }
}
