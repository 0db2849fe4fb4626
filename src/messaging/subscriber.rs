//! Queue subscription, consumer loop, and ack/nack discipline
//!
//! At bind time the subscriber declares the full topology: the main topic
//! exchange, the agent's durable queue (dead-lettering into
//! `<exchange>.dlx` after the message TTL), the DLX itself, and the
//! agent's DLQ, all bound under the agent's routing-key patterns. Each
//! delivery is handed to the agent core; success acks, any failure nacks
//! with `requeue=false` so the message dead-letters.

use std::sync::Arc;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::domain_types::{AgentName, CorrelationId, MessageTtlMs, PrefetchCount};
use crate::errors::ChimeraError;
use crate::messaging::agent::AgentCore;
use crate::messaging::channel::ChannelManager;
use crate::messaging::registry::{DeliveryProps, HandlerRegistry};

/// Channel name reserved for consuming.
const SUBSCRIBER_CHANNEL: &str = "subscriber";

/// What to do with a delivery after its handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Handler succeeded: acknowledge.
    Ack,
    /// Handler failed: reject without requeue so the broker dead-letters.
    DeadLetter,
}

/// Maps a handler outcome to the ack/nack discipline. Exactly one of the
/// two is emitted per delivery.
#[must_use]
pub fn ack_decision<T>(result: &Result<T, ChimeraError>) -> AckDecision {
    match result {
        Ok(_) => AckDecision::Ack,
        Err(_) => AckDecision::DeadLetter,
    }
}

/// Stops a running consumer loop.
#[derive(Clone)]
pub struct ShutdownHandle(watch::Sender<bool>);

impl ShutdownHandle {
    /// Requests the consumer loop to stop after the in-flight deliveries.
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

/// Consumes an agent's queue and drives handler dispatch.
pub struct EventSubscriber {
    channels: Arc<ChannelManager>,
    agent_name: AgentName,
    exchange: String,
    queue_name: String,
    prefetch: PrefetchCount,
    message_ttl: MessageTtlMs,
    shutdown: watch::Sender<bool>,
}

impl EventSubscriber {
    /// Creates a subscriber for the agent's queue (named after the
    /// agent) on the given exchange.
    #[must_use]
    pub fn new(
        channels: Arc<ChannelManager>,
        agent_name: AgentName,
        exchange: impl Into<String>,
        prefetch: PrefetchCount,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let queue_name = agent_name.as_ref().to_string();
        Self {
            channels,
            agent_name,
            exchange: exchange.into(),
            queue_name,
            prefetch,
            message_ttl: MessageTtlMs::default(),
            shutdown,
        }
    }

    /// Overrides the queue message TTL (tests use 0 for immediate
    /// dead-lettering).
    #[must_use]
    pub fn with_message_ttl(mut self, message_ttl: MessageTtlMs) -> Self {
        self.message_ttl = message_ttl;
        self
    }

    /// A handle that stops the consumer loop.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Declares exchanges, queues, DLQ, and bindings for the given
    /// routing-key patterns, then sets channel QoS.
    ///
    /// # Errors
    /// Propagates broker declaration failures.
    pub async fn bind(&self, routing_keys: &[String]) -> Result<(), ChimeraError> {
        let channel = self.channels.get(SUBSCRIBER_CHANNEL).await?;

        self.channels
            .declare_exchange(&channel, &self.exchange)
            .await?;

        let dlx_name = format!("{}.dlx", self.exchange);
        let dlq_name = format!("{}.dlq", self.queue_name);

        let mut queue_args = FieldTable::default();
        queue_args.insert(
            "x-dead-letter-exchange".to_string().into(),
            AMQPValue::LongString(dlx_name.clone().into()),
        );
        queue_args.insert(
            "x-message-ttl".to_string().into(),
            AMQPValue::LongInt(i32::try_from(self.message_ttl.as_u64()).unwrap_or(i32::MAX)),
        );
        self.channels
            .declare_queue(&channel, &self.queue_name, queue_args)
            .await?;

        self.channels.declare_exchange(&channel, &dlx_name).await?;
        self.channels
            .declare_queue(&channel, &dlq_name, FieldTable::default())
            .await?;

        for routing_key in routing_keys {
            self.channels
                .bind(&channel, &dlq_name, &dlx_name, routing_key)
                .await?;
            self.channels
                .bind(&channel, &self.queue_name, &self.exchange, routing_key)
                .await?;
        }

        channel
            .basic_qos(self.prefetch.as_u16(), BasicQosOptions::default())
            .await?;

        info!(
            queue = %self.queue_name,
            exchange = %self.exchange,
            routing_keys = ?routing_keys,
            prefetch = self.prefetch.as_u16(),
            "subscription bound"
        );
        Ok(())
    }

    /// Binds the topology for the registry's patterns and consumes until
    /// shutdown. Up to prefetch-count handlers run concurrently; the
    /// broker gates further deliveries on acks.
    ///
    /// # Errors
    /// Propagates bind and consume failures.
    pub async fn run(
        &self,
        core: Arc<AgentCore>,
        registry: Arc<HandlerRegistry>,
    ) -> Result<(), ChimeraError> {
        self.bind(&registry.patterns()).await?;

        let channel = self.channels.get(SUBSCRIBER_CHANNEL).await?;
        let mut consumer = channel
            .basic_consume(
                &self.queue_name,
                self.agent_name.as_ref(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let mut shutdown = self.shutdown.subscribe();

        info!(queue = %self.queue_name, "started consuming");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = consumer.next() => {
                    match next {
                        None => {
                            warn!(queue = %self.queue_name, "consumer stream ended");
                            break;
                        }
                        Some(Err(err)) => {
                            error!(queue = %self.queue_name, error = %err, "consume error");
                            return Err(err.into());
                        }
                        Some(Ok(delivery)) => {
                            let core = Arc::clone(&core);
                            let registry = Arc::clone(&registry);
                            tokio::spawn(async move {
                                process_delivery(core, registry, delivery).await;
                            });
                        }
                    }
                }
            }
        }
        info!(queue = %self.queue_name, "stopped consuming");
        Ok(())
    }
}

fn delivery_props(delivery: &Delivery) -> DeliveryProps {
    let properties = &delivery.properties;
    let mut headers = std::collections::BTreeMap::new();
    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(text) = value {
                headers.insert(
                    key.as_str().to_string(),
                    String::from_utf8_lossy(text.as_bytes()).to_string(),
                );
            }
        }
    }
    DeliveryProps {
        routing_key: delivery.routing_key.as_str().to_string(),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|id| CorrelationId::from(id.as_str().to_string())),
        sender: properties.app_id().as_ref().map(|id| id.as_str().to_string()),
        reply_to: properties
            .reply_to()
            .as_ref()
            .map(|reply| reply.as_str().to_string()),
        headers,
        redelivered: delivery.redelivered,
    }
}

async fn process_delivery(core: Arc<AgentCore>, registry: Arc<HandlerRegistry>, delivery: Delivery) {
    let props = delivery_props(&delivery);
    let body = delivery.data.clone();
    let result = core.handle_delivery(&registry, body, props).await;

    match ack_decision(&result) {
        AckDecision::Ack => {
            if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                error!(error = %err, "failed to ack delivery");
            }
        }
        AckDecision::DeadLetter => {
            let nack = delivery
                .nack(BasicNackOptions {
                    requeue: false,
                    ..BasicNackOptions::default()
                })
                .await;
            if let Err(err) = nack {
                error!(error = %err, "failed to nack delivery");
            }
        }
    }
}
