//! Broker connection lifecycle
//!
//! At most one open AMQP connection per process. Connection attempts
//! retry with bounded exponential backoff; a failed attempt leaves the
//! manager disconnected rather than holding partial state.

use std::time::Duration;

use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::BrokerConfig;
use crate::errors::ChimeraError;
use crate::resilience::RetryPolicy;

/// Default number of connection attempts before surfacing a terminal
/// error.
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Owns the single long-lived broker connection.
pub struct ConnectionManager {
    uri: String,
    redacted_target: String,
    retry: RetryPolicy,
    connection: Mutex<Option<Connection>>,
}

impl ConnectionManager {
    /// Creates a disconnected manager for the configured broker.
    #[must_use]
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            uri: config.amqp_uri(),
            redacted_target: format!("{}:{}", config.host, config.port),
            retry: RetryPolicy::exponential(DEFAULT_MAX_RETRIES, Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(60))
                .with_jitter(false),
            connection: Mutex::new(None),
        }
    }

    async fn establish(&self) -> Result<Connection, ChimeraError> {
        let target = self.redacted_target.clone();
        self.retry
            .run(|| {
                let target = target.clone();
                async move {
                    info!(broker = %target, "connecting to message broker");
                    Connection::connect(&self.uri, ConnectionProperties::default())
                        .await
                        .map_err(|err| {
                            warn!(broker = %target, error = %err, "broker connection attempt failed");
                            ChimeraError::from(err)
                        })
                }
            })
            .await
            .map_err(|err| {
                error!(broker = %self.redacted_target, "could not connect to message broker");
                err
            })
    }

    /// Connects if not already connected.
    ///
    /// # Errors
    /// Returns a terminal bus error after all attempts fail; the manager
    /// stays disconnected.
    pub async fn connect(&self) -> Result<(), ChimeraError> {
        let mut guard = self.connection.lock().await;
        if guard.as_ref().is_some_and(|c| c.status().connected()) {
            return Ok(());
        }
        *guard = None;
        let connection = self.establish().await?;
        info!(broker = %self.redacted_target, "connected to message broker");
        *guard = Some(connection);
        Ok(())
    }

    /// Opens a new channel, reconnecting first when the cached connection
    /// is closed.
    ///
    /// # Errors
    /// Propagates connection or channel-open failures.
    pub async fn create_channel(&self) -> Result<Channel, ChimeraError> {
        let mut guard = self.connection.lock().await;
        if guard.as_ref().is_none_or(|c| !c.status().connected()) {
            *guard = None;
            *guard = Some(self.establish().await?);
        }
        let connection = guard
            .as_ref()
            .ok_or_else(|| ChimeraError::system("broker connection unavailable"))?;
        Ok(connection.create_channel().await?)
    }

    /// Whether an open connection is currently held.
    pub async fn is_connected(&self) -> bool {
        let guard = self.connection.lock().await;
        guard.as_ref().is_some_and(|c| c.status().connected())
    }

    /// Closes the connection. Idempotent; closing a disconnected manager
    /// is a no-op.
    pub async fn close(&self) {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.take() {
            info!(broker = %self.redacted_target, "closing broker connection");
            if let Err(err) = connection.close(200, "shutdown").await {
                warn!(error = %err, "error closing broker connection");
            }
        }
    }
}
