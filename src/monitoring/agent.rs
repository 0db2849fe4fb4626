//! The monitoring agent
//!
//! Loads persisted alert rules at startup, accepts rule mutations over
//! `monitoring.rule.config` (re-persisting atomically), polls metric
//! sources on the scheduler, evaluates observations through the alert
//! engine, publishes `monitoring.alert` events, and fans alerts out to
//! the notification channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::errors::ChimeraError;
use crate::messaging::agent::AgentCore;
use crate::messaging::payloads::{
    routing_keys, AlertEvent, MetricPoint, RuleAction, RuleConfig,
};
use crate::messaging::registry::HandlerRegistry;
use crate::monitoring::alert_engine::{Alert, AlertEngine};
use crate::monitoring::notifier::NotificationDispatcher;
use crate::monitoring::scheduler::Scheduler;
use crate::monitoring::state::MonitoringStateStore;

/// Cadence of the correlation-reaper maintenance job.
const REAPER_INTERVAL: Duration = Duration::from_secs(600);

/// Entries older than this are reaped.
const CORRELATION_MAX_AGE: Duration = Duration::from_secs(3600);

/// A pollable origin of metric observations (exchange stats, node
/// telemetry). Collaborator contract only; implementations live outside
/// the core.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Source name for job ids and logging.
    fn name(&self) -> &str;

    /// Collects the current observations.
    async fn collect(&self) -> Result<Vec<MetricPoint>, ChimeraError>;
}

/// The monitoring agent.
pub struct MonitoringAgent {
    core: Arc<AgentCore>,
    engine: Arc<AlertEngine>,
    state: Arc<MonitoringStateStore>,
    dispatcher: Arc<NotificationDispatcher>,
    scheduler: Scheduler,
}

impl MonitoringAgent {
    /// Creates the agent around its collaborators.
    #[must_use]
    pub fn new(
        core: Arc<AgentCore>,
        state: Arc<MonitoringStateStore>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            core,
            engine: Arc::new(AlertEngine::new()),
            state,
            dispatcher,
            scheduler: Scheduler::new(),
        }
    }

    /// The alert engine, for introspection.
    #[must_use]
    pub fn engine(&self) -> Arc<AlertEngine> {
        Arc::clone(&self.engine)
    }

    /// The job scheduler, for introspection.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Loads every persisted rule into the engine. Called once at
    /// startup. Returns the number loaded.
    ///
    /// # Errors
    /// Propagates state-store failures.
    pub async fn load_rules(&self) -> Result<usize, ChimeraError> {
        let rules = self.state.load_all_rules().await?;
        let count = rules.len();
        for rule in rules {
            self.engine.add_rule(rule);
        }
        info!(count, "loaded alert rules");
        Ok(count)
    }

    /// Applies a rule mutation: the engine and the persistent store
    /// change together, persisting first so a crash between the two
    /// replays cleanly on restart.
    ///
    /// # Errors
    /// Propagates persistence failures; the in-memory engine is only
    /// touched after the store accepted the change.
    pub async fn apply_rule_config(&self, config: &RuleConfig) -> Result<(), ChimeraError> {
        match &config.action {
            RuleAction::Add { rule } => {
                self.state.save_rule(rule).await?;
                self.engine.add_rule(rule.clone());
            }
            RuleAction::Remove { rule_id } => {
                self.state.delete_rule(rule_id).await?;
                self.engine.remove_rule(rule_id);
            }
            RuleAction::SetEnabled { rule_id, enabled } => {
                let Some(mut rule) = self.engine.get_rule(rule_id) else {
                    return Err(ChimeraError::user(format!("unknown alert rule '{rule_id}'")));
                };
                rule.enabled = *enabled;
                self.state.save_rule(&rule).await?;
                self.engine.set_enabled(rule_id, *enabled);
            }
        }
        Ok(())
    }

    /// Evaluates one observation: fires matching rules, publishes an
    /// alert event per firing, and dispatches notifications. Returns the
    /// fired alerts.
    ///
    /// # Errors
    /// Propagates publish failures.
    pub async fn observe(&self, point: &MetricPoint) -> Result<Vec<Alert>, ChimeraError> {
        let Some(value) = point.value.as_number() else {
            debug!(metric = %point.metric, "skipping non-numeric observation");
            return Ok(Vec::new());
        };

        let alerts = self
            .engine
            .evaluate(&point.metric, value, Some(point.timestamp_ms));
        for alert in &alerts {
            let event = AlertEvent {
                metadata: self.core.metadata(None),
                alert: alert.clone(),
            };
            let correlation_id = event.metadata.correlation_id.clone();
            self.core
                .publish_event(&event, routing_keys::MONITORING_ALERT, Some(correlation_id))
                .await?;

            if let Some(rule) = self.engine.get_rule(&alert.rule_id) {
                self.dispatcher.send(alert, &rule.notification_channels).await;
            }
        }
        Ok(alerts)
    }

    /// Registers a polling job for a metric source. Each firing collects
    /// the source's observations and evaluates them.
    pub fn start_polling(self: &Arc<Self>, source: Arc<dyn MetricSource>, interval: Duration) {
        let job_id = format!("poll:{}", source.name());
        let agent = Arc::clone(self);
        self.scheduler.add_job(&job_id, interval, move || {
            let agent = Arc::clone(&agent);
            let source = Arc::clone(&source);
            async move {
                match source.collect().await {
                    Ok(points) => {
                        for point in &points {
                            if let Err(err) = agent.observe(point).await {
                                tracing::error!(error = %err, "alert evaluation failed");
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(source = source.name(), error = %err, "metric poll failed");
                    }
                }
            }
        });
    }

    /// Registers the background correlation reaper recommended for
    /// long-lived agents. The manual cleanup API remains the source of
    /// truth.
    pub fn start_maintenance(self: &Arc<Self>) {
        let agent = Arc::clone(self);
        self.scheduler
            .add_job("correlation-reaper", REAPER_INTERVAL, move || {
                let agent = Arc::clone(&agent);
                async move {
                    agent.core.cleanup_old_correlations(CORRELATION_MAX_AGE);
                }
            });
    }

    /// Builds the routing-key map for this agent.
    #[must_use]
    pub fn registry(self: &Arc<Self>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        let agent = Arc::clone(self);
        registry.on::<RuleConfig, _, _>(routing_keys::MONITORING_RULE_CONFIG, move |config, _props| {
            let agent = Arc::clone(&agent);
            async move { agent.apply_rule_config(&config).await }
        });
        registry
    }
}
