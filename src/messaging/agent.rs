//! Agent core: publisher, subscriber, and correlation tracking fused
//!
//! [`AgentCore`] is the surface agents program against: fire-and-forget
//! events, correlation-tracked requests, responses, and explicit
//! correlation lifecycle. Handler dispatch is total; an error escaping a
//! handler produces an error message on the chain's error routing key and
//! sends the delivery down the DLQ path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, warn, Instrument};

use crate::config::ChimeraConfig;
use crate::domain_types::{AgentName, CorrelationId, PrefetchCount};
use crate::errors::ChimeraError;
use crate::logging;
use crate::messaging::channel::ChannelManager;
use crate::messaging::connection::ConnectionManager;
use crate::messaging::correlation::{CorrelationEntry, CorrelationRegistry};
use crate::messaging::envelope::{self, MessageMetadata};
use crate::messaging::payloads::AgentError;
use crate::messaging::publisher::{EventPublisher, MessagePublisher, PublishOptions};
use crate::messaging::registry::{DeliveryProps, HandlerRegistry};
use crate::messaging::subscriber::{EventSubscriber, ShutdownHandle};
use crate::messaging::DEFAULT_EXCHANGE;
use crate::telemetry;

/// Derives the error routing key for a chain: the first segment of the
/// failed routing key plus `.error`.
#[must_use]
pub fn error_routing_key(routing_key: &str) -> String {
    let head = routing_key.split('.').next().unwrap_or(routing_key);
    format!("{head}.error")
}

/// The per-agent messaging surface.
pub struct AgentCore {
    name: AgentName,
    publisher: Arc<dyn MessagePublisher>,
    correlations: CorrelationRegistry,
}

impl AgentCore {
    /// Creates a core around a publisher.
    #[must_use]
    pub fn new(name: AgentName, publisher: Arc<dyn MessagePublisher>) -> Self {
        Self {
            name,
            publisher,
            correlations: CorrelationRegistry::new(),
        }
    }

    /// This agent's name.
    #[must_use]
    pub fn name(&self) -> &AgentName {
        &self.name
    }

    /// Builds envelope metadata for an outgoing payload.
    #[must_use]
    pub fn metadata(&self, correlation_id: Option<CorrelationId>) -> MessageMetadata {
        MessageMetadata::new(&self.name, correlation_id, None)
    }

    /// Publishes a fire-and-forget event. Generates a correlation ID when
    /// none is given and returns the one used.
    ///
    /// # Errors
    /// Propagates serialization and publish failures.
    pub async fn publish_event<P: Serialize + Sync>(
        &self,
        message: &P,
        routing_key: &str,
        correlation_id: Option<CorrelationId>,
    ) -> Result<CorrelationId, ChimeraError> {
        let correlation_id = correlation_id.unwrap_or_else(CorrelationId::generate);
        let body = envelope::serialize(message)?;
        self.publisher
            .publish_raw(
                routing_key,
                body,
                PublishOptions {
                    correlation_id: Some(correlation_id.clone()),
                    ..PublishOptions::default()
                },
            )
            .await?;
        Ok(correlation_id)
    }

    /// Publishes a request expecting a reply on another routing key.
    /// Stores a correlation entry holding the caller's context and
    /// returns the generated correlation ID.
    ///
    /// # Errors
    /// Propagates serialization and publish failures.
    pub async fn publish_request<P: Serialize + Sync>(
        &self,
        message: &P,
        routing_key: &str,
        reply_routing_key: &str,
        context: HashMap<String, String>,
    ) -> Result<CorrelationId, ChimeraError> {
        let body = envelope::serialize(message)?;
        let correlation_id = CorrelationId::generate();
        self.correlations
            .store(&correlation_id, routing_key, reply_routing_key, context);
        let publish = self
            .publisher
            .publish_raw(
                routing_key,
                body,
                PublishOptions {
                    correlation_id: Some(correlation_id.clone()),
                    reply_to: Some(reply_routing_key.to_string()),
                    ..PublishOptions::default()
                },
            )
            .await;
        if let Err(err) = publish {
            // The request never left; do not leave a dangling entry
            self.correlations.clear(&correlation_id);
            return Err(err);
        }
        Ok(correlation_id)
    }

    /// Publishes a response carrying the caller's correlation ID.
    ///
    /// # Errors
    /// Propagates serialization and publish failures.
    pub async fn publish_response<P: Serialize + Sync>(
        &self,
        message: &P,
        routing_key: &str,
        correlation_id: &CorrelationId,
    ) -> Result<(), ChimeraError> {
        let body = envelope::serialize(message)?;
        self.publisher
            .publish_raw(
                routing_key,
                body,
                PublishOptions {
                    correlation_id: Some(correlation_id.clone()),
                    ..PublishOptions::default()
                },
            )
            .await
    }

    /// Publishes a standardized error message on the given routing key
    /// with the chain's correlation ID.
    ///
    /// # Errors
    /// Propagates publish failures.
    pub async fn publish_error(
        &self,
        err: &ChimeraError,
        routing_key: &str,
        correlation_id: &CorrelationId,
    ) -> Result<(), ChimeraError> {
        let payload = AgentError {
            metadata: MessageMetadata::response(&self.name, correlation_id.clone()),
            error: err.to_body(),
        };
        self.publish_response(&payload, routing_key, correlation_id)
            .await
    }

    /// Looks up the stored context for a correlation ID.
    #[must_use]
    pub fn get_correlation_context(&self, correlation_id: &CorrelationId) -> Option<CorrelationEntry> {
        self.correlations.get(correlation_id)
    }

    /// Clears a correlation entry. Returns whether one existed.
    pub fn clear_correlation(&self, correlation_id: &CorrelationId) -> bool {
        self.correlations.clear(correlation_id)
    }

    /// Reaps entries older than `max_age` and returns how many were
    /// removed.
    pub fn cleanup_old_correlations(&self, max_age: Duration) -> usize {
        self.correlations.cleanup_older_than(max_age)
    }

    /// Number of outstanding correlation entries.
    #[must_use]
    pub fn outstanding_correlations(&self) -> usize {
        self.correlations.len()
    }

    /// Handles one delivery end to end: opens the handler span (parented
    /// on the sender's trace context), binds the ambient correlation ID,
    /// and dispatches through the registry. On handler failure an error
    /// message goes out on the chain's error routing key before the error
    /// propagates to the ack/nack boundary.
    ///
    /// # Errors
    /// Returns the dispatch error so the subscriber nacks the delivery.
    pub async fn handle_delivery(
        &self,
        registry: &HandlerRegistry,
        body: Vec<u8>,
        props: DeliveryProps,
    ) -> Result<(), ChimeraError> {
        let routing_key = props.routing_key.clone();
        let correlation_id = props.correlation_id.clone();
        let span = telemetry::handler_span(
            self.name.as_ref(),
            &routing_key,
            correlation_id.as_ref().map(CorrelationId::as_str),
            &props.headers,
        );

        let dispatch = registry.dispatch(body, props);
        let result = match &correlation_id {
            Some(id) => logging::with_correlation_id(id, dispatch.instrument(span)).await,
            None => dispatch.instrument(span).await,
        };

        if let Err(err) = &result {
            error!(
                routing_key = %routing_key,
                error = %err,
                "handler failed, delivery will be dead-lettered"
            );
            // Error messages about error messages would loop forever
            if !routing_key.ends_with(".error") {
                if let Some(id) = &correlation_id {
                    let error_key = error_routing_key(&routing_key);
                    if let Err(publish_err) = self.publish_error(err, &error_key, id).await {
                        warn!(error = %publish_err, "failed to publish error message");
                    }
                }
            }
        }
        result
    }
}

/// Everything one agent process needs: connection, channels, core, and
/// the subscriber loop.
pub struct AgentRuntime {
    connections: Arc<ConnectionManager>,
    channels: Arc<ChannelManager>,
    core: Arc<AgentCore>,
    subscriber: EventSubscriber,
}

impl AgentRuntime {
    /// Connects to the broker and assembles the messaging stack for one
    /// agent on the default exchange.
    ///
    /// # Errors
    /// Propagates connection and topology failures.
    pub async fn connect(
        config: &ChimeraConfig,
        name: AgentName,
        prefetch: PrefetchCount,
    ) -> Result<Self, ChimeraError> {
        let connections = Arc::new(ConnectionManager::new(&config.broker));
        connections.connect().await?;
        let channels = Arc::new(ChannelManager::new(Arc::clone(&connections)));
        let publisher = Arc::new(
            EventPublisher::new(Arc::clone(&channels), name.clone(), DEFAULT_EXCHANGE).await?,
        );
        let core = Arc::new(AgentCore::new(name.clone(), publisher));
        let subscriber =
            EventSubscriber::new(Arc::clone(&channels), name, DEFAULT_EXCHANGE, prefetch);
        Ok(Self {
            connections,
            channels,
            core,
            subscriber,
        })
    }

    /// The agent core, for building handler registries.
    #[must_use]
    pub fn core(&self) -> Arc<AgentCore> {
        Arc::clone(&self.core)
    }

    /// A handle that stops the consumer loop.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.subscriber.shutdown_handle()
    }

    /// Runs the subscriber loop until shutdown is requested.
    ///
    /// # Errors
    /// Propagates consume failures.
    pub async fn run(&self, registry: HandlerRegistry) -> Result<(), ChimeraError> {
        self.subscriber
            .run(Arc::clone(&self.core), Arc::new(registry))
            .await
    }

    /// Closes channels and the broker connection.
    pub async fn close(&self) {
        self.channels.close_all().await;
        self.connections.close().await;
    }
}
