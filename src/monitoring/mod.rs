//! Metric monitoring: rules, scheduling, alerts, and notifications

pub mod agent;
pub mod alert_engine;
pub mod notifier;
pub mod scheduler;
pub mod state;

pub use agent::{MetricSource, MonitoringAgent};
pub use alert_engine::{
    Alert, AlertCondition, AlertEngine, AlertRule, ComparisonOp, Severity,
};
pub use notifier::{
    EmailChannel, NotificationChannel, NotificationDispatcher, PushChannel, SmsChannel,
    WebhookChannel,
};
pub use scheduler::{JobStatus, Scheduler};
pub use state::MonitoringStateStore;
