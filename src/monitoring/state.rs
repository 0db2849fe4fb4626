//! Alert-rule persistence in the key-value store
//!
//! Rules live under `monitoring:rule:<rule-id>` as JSON and survive agent
//! restarts; the monitoring agent loads them all at startup and
//! re-persists on every configuration change.

use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::ChimeraError;
use crate::monitoring::alert_engine::AlertRule;
use crate::storage::KeyValueStore;

const KEY_PREFIX: &str = "monitoring:rule:";

/// Persistent store of alert rules.
pub struct MonitoringStateStore {
    kv: Arc<dyn KeyValueStore>,
}

impl MonitoringStateStore {
    /// Creates a store over the given backend.
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn key(rule_id: &str) -> String {
        format!("{KEY_PREFIX}{rule_id}")
    }

    /// Persists one rule, replacing any previous version atomically.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn save_rule(&self, rule: &AlertRule) -> Result<(), ChimeraError> {
        let raw = serde_json::to_string(rule)?;
        self.kv.set(&Self::key(&rule.id), &raw).await?;
        info!(rule_id = %rule.id, "saved alert rule");
        Ok(())
    }

    /// Loads one rule. `None` when absent; a corrupt record is logged
    /// and treated as absent so one bad key cannot block startup.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn load_rule(&self, rule_id: &str) -> Result<Option<AlertRule>, ChimeraError> {
        match self.kv.get(&Self::key(rule_id)).await? {
            None => Ok(None),
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(rule) => Ok(Some(rule)),
                Err(err) => {
                    warn!(rule_id, error = %err, "skipping unreadable alert rule");
                    Ok(None)
                }
            },
        }
    }

    /// Loads every persisted rule.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn load_all_rules(&self) -> Result<Vec<AlertRule>, ChimeraError> {
        let mut rules = Vec::new();
        for key in self.kv.scan_prefix(KEY_PREFIX).await? {
            let rule_id = key.trim_start_matches(KEY_PREFIX);
            if let Some(rule) = self.load_rule(rule_id).await? {
                rules.push(rule);
            }
        }
        Ok(rules)
    }

    /// Deletes one rule.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn delete_rule(&self, rule_id: &str) -> Result<(), ChimeraError> {
        self.kv.delete(&Self::key(rule_id)).await?;
        info!(rule_id, "deleted alert rule");
        Ok(())
    }
}
