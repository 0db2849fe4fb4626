//! Typed payload schemas for every routing key on the bus
//!
//! Payload shapes are negotiated between collaborating agents; the
//! messaging core never looks inside them beyond the serialize and
//! deserialize boundaries. Every payload embeds a
//! [`MessageMetadata`](crate::messaging::envelope::MessageMetadata)
//! sub-record.

use serde::{Deserialize, Serialize};

use crate::errors::ErrorBody;
use crate::messaging::envelope::MessageMetadata;
use crate::monitoring::alert_engine::{Alert, AlertRule};

/// The stable routing keys agents publish and consume on.
pub mod routing_keys {
    pub const QUERY_REQUEST: &str = "query.request";
    pub const QUERY_RESPONSE: &str = "query.response";
    pub const QUERY_ERROR: &str = "query.error";
    pub const DATA_RETRIEVAL_REQUEST: &str = "data_retrieval.request";
    pub const DATA_RETRIEVAL_RESPONSE: &str = "data_retrieval.response";
    pub const ANALYSIS_REQUEST: &str = "analysis.request";
    pub const ANALYSIS_RESULT: &str = "analysis.result";
    pub const ANALYSIS_ERROR: &str = "analysis.error";
    pub const NARRATIVE_REQUEST: &str = "narrative.request";
    pub const NARRATIVE_GENERATED: &str = "narrative.generated";
    pub const FACT_CHECK_REQUEST: &str = "fact_check.request";
    pub const FACT_CHECK_RESULT: &str = "fact_check.result";
    pub const FOLLOWUP_REQUEST: &str = "followup.request";
    pub const FOLLOWUP_SUGGESTIONS: &str = "followup.suggestions";
    pub const MONITORING_RULE_CONFIG: &str = "monitoring.rule.config";
    pub const MONITORING_ALERT: &str = "monitoring.alert";
}

/// Categories of entities recognized in user queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Asset,
    Metric,
    TimeRange,
    Date,
    Exchange,
    Other,
}

/// One entity extracted from a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: EntityType,
    pub value: String,
    pub confidence: f64,
    /// Where the entity came from: the query itself or merged session
    /// context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Entity {
    /// An entity extracted directly from the current query.
    #[must_use]
    pub fn from_query(entity_type: EntityType, value: impl Into<String>, confidence: f64) -> Self {
        Self {
            entity_type,
            value: value.into(),
            confidence,
            source: None,
        }
    }

    /// An entity filled in from session context.
    #[must_use]
    pub fn from_context(entity_type: EntityType, value: impl Into<String>, confidence: f64) -> Self {
        Self {
            entity_type,
            value: value.into(),
            confidence,
            source: Some("context".to_string()),
        }
    }
}

/// A half-open time window in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ms: i64,
    pub end_ms: i64,
}

/// Broad intent classes for user questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    PriceCheck,
    TrendAnalysis,
    Comparison,
    AnomalyInvestigation,
    General,
}

/// Classified intent of one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryIntent {
    pub intent_type: IntentType,
    pub metrics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
}

/// A metric observation as carried on the wire: numeric, textual, or
/// absent. Replaces runtime reflection with an explicit tagged union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    Number(f64),
    Text(String),
    Absent,
}

impl MetricValue {
    /// The numeric reading, parsing textual values when possible.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.parse().ok(),
            Self::Absent => None,
        }
    }
}

/// One timestamped metric observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub metric: String,
    pub value: MetricValue,
    pub timestamp_ms: i64,
}

/// `query.request` — a user question entering the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub metadata: MessageMetadata,
    pub session_id: String,
    pub query: String,
}

/// `query.response` — the assembled answer for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub metadata: MessageMetadata,
    pub session_id: String,
    pub answer: String,
    pub intent: QueryIntent,
    pub entities: Vec<Entity>,
}

/// `data_retrieval.request` — fetch metrics for an asset over a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRetrievalRequest {
    pub metadata: MessageMetadata,
    pub asset: String,
    pub metrics: Vec<String>,
    pub time_range: TimeRange,
}

/// `data_retrieval.response` — the fetched observations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRetrievalResponse {
    pub metadata: MessageMetadata,
    pub asset: String,
    pub points: Vec<MetricPoint>,
    /// Which upstream source produced the data.
    pub source: String,
}

/// `analysis.request` — analyze a set of observations directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub metadata: MessageMetadata,
    pub asset: String,
    pub points: Vec<MetricPoint>,
}

/// Summary statistics for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub metric: String,
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
}

/// One detected anomaly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub metric: String,
    pub timestamp_ms: i64,
    pub value: f64,
    /// Standard deviations from the mean.
    pub score: f64,
    pub description: String,
}

/// `analysis.result` — statistics and anomalies for an asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub metadata: MessageMetadata,
    pub asset: String,
    pub summaries: Vec<MetricSummary>,
    pub anomalies: Vec<Anomaly>,
}

/// `narrative.request` — render analysis into prose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativeRequest {
    pub metadata: MessageMetadata,
    pub asset: String,
    pub summaries: Vec<MetricSummary>,
    pub anomalies: Vec<Anomaly>,
}

/// `narrative.generated` — the rendered narrative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativeGenerated {
    pub metadata: MessageMetadata,
    pub narrative: String,
    /// Which generator produced the text (model name or template).
    pub generator: String,
}

/// A single factual claim to verify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub asset: String,
    pub metric: String,
    pub claimed_value: f64,
}

/// `fact_check.request` — claims extracted from a narrative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactCheckRequest {
    pub metadata: MessageMetadata,
    pub claims: Vec<Claim>,
}

/// Verdict for one claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimVerdict {
    pub claim: Claim,
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// `fact_check.result` — verdicts for a request's claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactCheckResult {
    pub metadata: MessageMetadata,
    pub verdicts: Vec<ClaimVerdict>,
}

/// `followup.request` — derive follow-up suggestions for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpRequest {
    pub metadata: MessageMetadata,
    pub session_id: String,
    pub query: String,
    pub intent: QueryIntent,
}

/// `followup.suggestions` — ranked follow-up questions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpSuggestions {
    pub metadata: MessageMetadata,
    pub session_id: String,
    pub suggestions: Vec<String>,
}

/// Mutations accepted on `monitoring.rule.config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    Add { rule: AlertRule },
    Remove { rule_id: String },
    SetEnabled { rule_id: String, enabled: bool },
}

/// `monitoring.rule.config` — alert-rule configuration message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub metadata: MessageMetadata,
    #[serde(flatten)]
    pub action: RuleAction,
}

/// `monitoring.alert` — a fired alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub metadata: MessageMetadata,
    pub alert: Alert,
}

/// `<chain>.error` — the standardized on-bus error message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentError {
    pub metadata: MessageMetadata,
    pub error: ErrorBody,
}
