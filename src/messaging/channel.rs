//! Logical channel multiplexing and topology declarations
//!
//! Channels are cheap broker-side multiplexers over the shared
//! connection. Named channels are cached and lazily re-opened when the
//! broker closes them; topology declarations are idempotent.

use std::sync::Arc;

use dashmap::DashMap;
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, ExchangeKind};
use tracing::{info, warn};

use crate::errors::ChimeraError;
use crate::messaging::connection::ConnectionManager;

/// Multiplexes named logical channels over the process connection.
pub struct ChannelManager {
    connections: Arc<ConnectionManager>,
    channels: DashMap<String, Channel>,
}

impl ChannelManager {
    /// Creates a manager with no open channels.
    #[must_use]
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            channels: DashMap::new(),
        }
    }

    /// Returns the named channel, opening one lazily. A cached channel
    /// the broker has since closed is discarded and replaced.
    ///
    /// # Errors
    /// Propagates connection and channel-open failures.
    pub async fn get(&self, name: &str) -> Result<Channel, ChimeraError> {
        if let Some(cached) = self.channels.get(name) {
            let channel = cached.clone();
            drop(cached);
            if channel.status().connected() {
                return Ok(channel);
            }
            warn!(channel = name, "cached channel is closed, reopening");
            self.channels.remove(name);
        }

        let channel = self.connections.create_channel().await?;
        info!(channel = name, "opened channel");
        self.channels.insert(name.to_string(), channel.clone());
        Ok(channel)
    }

    /// Drops the named channel from the cache and closes it.
    pub async fn discard(&self, name: &str) {
        if let Some((_, channel)) = self.channels.remove(name) {
            if channel.status().connected() {
                if let Err(err) = channel.close(200, "discarded").await {
                    warn!(channel = name, error = %err, "error closing channel");
                }
            }
        }
    }

    /// Runs a scope against the named channel. On failure the channel is
    /// closed and discarded so the next use starts clean; the failure
    /// propagates.
    ///
    /// # Errors
    /// Returns the scope's error after discarding the channel.
    pub async fn with_channel<T, F, Fut>(&self, name: &str, scope: F) -> Result<T, ChimeraError>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = Result<T, ChimeraError>>,
    {
        let channel = self.get(name).await?;
        match scope(channel).await {
            Ok(value) => Ok(value),
            Err(err) => {
                self.discard(name).await;
                Err(err)
            }
        }
    }

    /// Closes every cached channel.
    pub async fn close_all(&self) {
        let names: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.discard(&name).await;
        }
    }

    /// Declares a durable topic exchange. Idempotent.
    ///
    /// # Errors
    /// Propagates broker declaration failures.
    pub async fn declare_exchange(&self, channel: &Channel, name: &str) -> Result<(), ChimeraError> {
        channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// Declares a durable queue with the given arguments. Idempotent.
    ///
    /// # Errors
    /// Propagates broker declaration failures.
    pub async fn declare_queue(
        &self,
        channel: &Channel,
        name: &str,
        arguments: FieldTable,
    ) -> Result<(), ChimeraError> {
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await?;
        Ok(())
    }

    /// Binds a queue to an exchange under a routing-key pattern.
    /// Idempotent.
    ///
    /// # Errors
    /// Propagates broker binding failures.
    pub async fn bind(
        &self,
        channel: &Channel,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ChimeraError> {
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }
}
