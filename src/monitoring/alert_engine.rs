//! Alert rule evaluation
//!
//! Rules pair a numeric condition with notification channels. Evaluation
//! tests every enabled rule for the observed metric, honors per-rule
//! cooldowns, and derives severity from the relative deviation from the
//! threshold.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain_types::epoch_millis;

/// Comparison operators usable in alert conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
}

impl ComparisonOp {
    /// Tests a value against a threshold. Equality uses an absolute
    /// epsilon of 0.01.
    #[must_use]
    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::LessThan => value < threshold,
            Self::GreaterOrEqual => value >= threshold,
            Self::LessOrEqual => value <= threshold,
            Self::Equal => (value - threshold).abs() < 0.01,
        }
    }
}

/// The numeric condition of one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertCondition {
    pub metric: String,
    pub operator: ComparisonOp,
    pub threshold: f64,
    /// How long the condition must hold. Advisory for pollers choosing
    /// their cadence.
    pub duration_seconds: u64,
    /// Minimum seconds between alerts from this rule.
    pub cooldown_seconds: u64,
}

/// A persisted alert rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub condition: AlertCondition,
    pub notification_channels: Vec<String>,
    pub enabled: bool,
}

/// Alert severity, derived from deviation from the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A fired alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub rule_id: String,
    pub rule_name: String,
    pub timestamp_ms: i64,
    pub metric: String,
    pub current_value: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub suggested_actions: Vec<String>,
}

/// Evaluates observations against the registered rules.
#[derive(Default)]
pub struct AlertEngine {
    rules: DashMap<String, AlertRule>,
    history: DashMap<String, Vec<Alert>>,
    last_alert_ms: DashMap<String, i64>,
}

impl AlertEngine {
    /// Creates an engine with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a rule.
    pub fn add_rule(&self, rule: AlertRule) {
        info!(rule_id = %rule.id, rule_name = %rule.name, "added alert rule");
        self.history.entry(rule.id.clone()).or_default();
        self.rules.insert(rule.id.clone(), rule);
    }

    /// Removes a rule and its history. Returns whether it existed.
    pub fn remove_rule(&self, rule_id: &str) -> bool {
        self.history.remove(rule_id);
        self.last_alert_ms.remove(rule_id);
        let removed = self.rules.remove(rule_id).is_some();
        if removed {
            info!(rule_id, "removed alert rule");
        }
        removed
    }

    /// Enables or disables a rule. Returns whether it existed.
    pub fn set_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        match self.rules.get_mut(rule_id) {
            Some(mut rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Looks up a rule.
    #[must_use]
    pub fn get_rule(&self, rule_id: &str) -> Option<AlertRule> {
        self.rules.get(rule_id).map(|rule| rule.clone())
    }

    /// All registered rules.
    #[must_use]
    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Evaluates one observation against every enabled rule for the
    /// metric. Fired alerts are recorded in rule-local history and stamp
    /// the rule's cooldown.
    pub fn evaluate(&self, metric: &str, value: f64, timestamp_ms: Option<i64>) -> Vec<Alert> {
        let now_ms = timestamp_ms.unwrap_or_else(epoch_millis);
        let mut alerts = Vec::new();

        for entry in &self.rules {
            let rule = entry.value();
            if !rule.enabled || rule.condition.metric != metric {
                continue;
            }
            if !rule.condition.operator.evaluate(value, rule.condition.threshold) {
                continue;
            }
            if let Some(last) = self.last_alert_ms.get(&rule.id) {
                let cooldown_ms = i64::try_from(rule.condition.cooldown_seconds)
                    .unwrap_or(i64::MAX)
                    .saturating_mul(1000);
                if now_ms - *last < cooldown_ms {
                    continue;
                }
            }

            let alert = Alert {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                timestamp_ms: now_ms,
                metric: metric.to_string(),
                current_value: value,
                threshold: rule.condition.threshold,
                severity: severity_for(value, rule.condition.threshold),
                suggested_actions: vec![
                    format!("Review {metric} data for anomalies"),
                    "Check related metrics for correlation".to_string(),
                ],
            };
            warn!(
                rule_name = %rule.name,
                metric,
                value,
                threshold = rule.condition.threshold,
                severity = ?alert.severity,
                "alert triggered"
            );

            self.history.entry(rule.id.clone()).or_default().push(alert.clone());
            self.last_alert_ms.insert(rule.id.clone(), now_ms);
            alerts.push(alert);
        }
        alerts
    }

    /// The most recent alerts fired by a rule, oldest first.
    #[must_use]
    pub fn alert_history(&self, rule_id: &str, limit: usize) -> Vec<Alert> {
        self.history
            .get(rule_id)
            .map(|alerts| {
                let skip = alerts.len().saturating_sub(limit);
                alerts[skip..].to_vec()
            })
            .unwrap_or_default()
    }
}

/// Severity from relative deviation: >50% critical, >20% high,
/// >10% medium, otherwise low.
fn severity_for(value: f64, threshold: f64) -> Severity {
    let deviation = if threshold.abs() > f64::EPSILON {
        (value - threshold).abs() / threshold.abs()
    } else {
        0.0
    };
    if deviation > 0.5 {
        Severity::Critical
    } else if deviation > 0.2 {
        Severity::High
    } else if deviation > 0.1 {
        Severity::Medium
    } else {
        Severity::Low
    }
}
