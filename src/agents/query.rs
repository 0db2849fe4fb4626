//! Query agent: natural-language entry point
//!
//! Classifies intent and entities from the user's question, merges
//! session context from previous turns, kicks off data retrieval as a
//! tracked request, and assembles the final answer when the analysis
//! result comes back under the same correlation ID.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::domain_types::epoch_millis;
use crate::errors::ChimeraError;
use crate::messaging::agent::AgentCore;
use crate::messaging::payloads::{
    routing_keys, AnalysisResult, DataRetrievalRequest, Entity, EntityType, FollowUpRequest,
    IntentType, QueryIntent, QueryRequest, QueryResponse, TimeRange,
};
use crate::messaging::registry::{DeliveryProps, HandlerRegistry};
use crate::session::{merge_context_entities, SessionContextStore};

/// Assets the recognizer knows about.
const KNOWN_ASSETS: [&str; 5] = ["ZEC", "BTC", "ETH", "SOL", "XMR"];

/// Metrics the recognizer knows about.
const KNOWN_METRICS: [&str; 4] = ["price", "volume", "volatility", "transactions"];

const DAY_MS: i64 = 86_400_000;

/// Classifies a query into an intent with metrics and an optional time
/// range.
#[must_use]
pub fn classify_intent(query: &str) -> QueryIntent {
    let lowered = query.to_lowercase();

    let intent_type = if ["anomaly", "spike", "unusual", "sudden"]
        .iter()
        .any(|kw| lowered.contains(kw))
    {
        IntentType::AnomalyInvestigation
    } else if ["compare", "versus", " vs ", "against"]
        .iter()
        .any(|kw| lowered.contains(kw))
    {
        IntentType::Comparison
    } else if ["trend", "over time", "history", "chart"]
        .iter()
        .any(|kw| lowered.contains(kw))
    {
        IntentType::TrendAnalysis
    } else if ["price", "cost", "worth", "value"]
        .iter()
        .any(|kw| lowered.contains(kw))
    {
        IntentType::PriceCheck
    } else {
        IntentType::General
    };

    let metrics: Vec<String> = KNOWN_METRICS
        .iter()
        .filter(|metric| lowered.contains(*metric))
        .map(|metric| (*metric).to_string())
        .collect();

    let now = epoch_millis();
    let time_range = if lowered.contains("24h") || lowered.contains("today") {
        Some(TimeRange { start_ms: now - DAY_MS, end_ms: now })
    } else if lowered.contains("week") || lowered.contains("7d") {
        Some(TimeRange { start_ms: now - 7 * DAY_MS, end_ms: now })
    } else if lowered.contains("month") || lowered.contains("30d") {
        Some(TimeRange { start_ms: now - 30 * DAY_MS, end_ms: now })
    } else {
        None
    };

    QueryIntent {
        intent_type,
        metrics,
        time_range,
    }
}

/// Extracts asset and metric entities from a query.
#[must_use]
pub fn extract_entities(query: &str) -> Vec<Entity> {
    let lowered = query.to_lowercase();
    let mut entities = Vec::new();
    for asset in KNOWN_ASSETS {
        if lowered.contains(&asset.to_lowercase()) {
            entities.push(Entity::from_query(EntityType::Asset, asset, 0.9));
        }
    }
    for metric in KNOWN_METRICS {
        if lowered.contains(metric) {
            entities.push(Entity::from_query(EntityType::Metric, metric, 0.85));
        }
    }
    entities
}

/// The query agent.
pub struct QueryAgent {
    core: Arc<AgentCore>,
    sessions: Arc<SessionContextStore>,
}

impl QueryAgent {
    /// Creates the agent around its collaborators.
    #[must_use]
    pub fn new(core: Arc<AgentCore>, sessions: Arc<SessionContextStore>) -> Self {
        Self { core, sessions }
    }

    /// Handles one user question: classify, merge context, record the
    /// turn, and fan out data retrieval expecting the analysis result
    /// back.
    ///
    /// # Errors
    /// Query parsing failures are non-retryable query errors; downstream
    /// publish failures propagate.
    pub async fn handle_query_request(&self, request: QueryRequest) -> Result<(), ChimeraError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(ChimeraError::query("empty query"));
        }

        let intent = classify_intent(query);
        let entities = extract_entities(query);

        let context = self
            .sessions
            .extract_for_query(&request.session_id, query)
            .await?;
        let entities = merge_context_entities(&entities, &context);

        self.sessions
            .append_query(&request.session_id, query, intent.clone(), entities.clone())
            .await?;

        let asset = entities
            .iter()
            .find(|entity| entity.entity_type == EntityType::Asset)
            .map(|entity| entity.value.clone())
            .unwrap_or_else(|| "ZEC".to_string());
        let metrics = if intent.metrics.is_empty() {
            vec!["price".to_string()]
        } else {
            intent.metrics.clone()
        };
        let now = epoch_millis();
        let time_range = intent
            .time_range
            .or(context.time_range)
            .unwrap_or(TimeRange { start_ms: now - DAY_MS, end_ms: now });

        let retrieval = DataRetrievalRequest {
            metadata: self.core.metadata(None),
            asset,
            metrics,
            time_range,
        };
        let mut request_context = HashMap::new();
        request_context.insert("session_id".to_string(), request.session_id.clone());
        request_context.insert("query".to_string(), query.to_string());
        request_context.insert(
            "intent".to_string(),
            serde_json::to_string(&intent).unwrap_or_default(),
        );

        let correlation_id = self
            .core
            .publish_request(
                &retrieval,
                routing_keys::DATA_RETRIEVAL_REQUEST,
                routing_keys::ANALYSIS_RESULT,
                request_context,
            )
            .await?;
        info!(
            session_id = %request.session_id,
            correlation_id = %correlation_id,
            "query fanned out to data retrieval"
        );
        Ok(())
    }

    /// Handles an analysis result: matches it back to the originating
    /// query via the correlation ID, answers the session, and suggests
    /// follow-ups.
    ///
    /// # Errors
    /// Propagates publish failures.
    pub async fn handle_analysis_result(
        &self,
        result: AnalysisResult,
        props: DeliveryProps,
    ) -> Result<(), ChimeraError> {
        let Some(correlation_id) = props.correlation_id else {
            warn!("analysis result without correlation id, ignoring");
            return Ok(());
        };
        // A result we have no entry for is best-effort: it may predate a
        // restart of this agent
        let Some(entry) = self.core.get_correlation_context(&correlation_id) else {
            warn!(
                correlation_id = %correlation_id,
                "analysis result for unknown correlation, skipping response"
            );
            return Ok(());
        };

        let session_id = entry
            .context
            .get("session_id")
            .cloned()
            .unwrap_or_default();
        let query = entry.context.get("query").cloned().unwrap_or_default();
        let intent: QueryIntent = entry
            .context
            .get("intent")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(QueryIntent {
                intent_type: IntentType::General,
                metrics: vec![],
                time_range: None,
            });

        let response = QueryResponse {
            metadata: self.core.metadata(Some(correlation_id.clone())),
            session_id: session_id.clone(),
            answer: compose_answer(&result),
            intent: intent.clone(),
            entities: extract_entities(&query),
        };
        self.core
            .publish_response(&response, routing_keys::QUERY_RESPONSE, &correlation_id)
            .await?;

        let followup = FollowUpRequest {
            metadata: self.core.metadata(Some(correlation_id.clone())),
            session_id,
            query,
            intent,
        };
        self.core
            .publish_event(
                &followup,
                routing_keys::FOLLOWUP_REQUEST,
                Some(correlation_id.clone()),
            )
            .await?;

        self.core.clear_correlation(&correlation_id);
        Ok(())
    }

    /// Builds the routing-key map for this agent.
    #[must_use]
    pub fn registry(self: &Arc<Self>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();

        let agent = Arc::clone(self);
        registry.on::<QueryRequest, _, _>(routing_keys::QUERY_REQUEST, move |request, _props| {
            let agent = Arc::clone(&agent);
            async move { agent.handle_query_request(request).await }
        });

        let agent = Arc::clone(self);
        registry.on::<AnalysisResult, _, _>(routing_keys::ANALYSIS_RESULT, move |result, props| {
            let agent = Arc::clone(&agent);
            async move { agent.handle_analysis_result(result, props).await }
        });

        registry
    }
}

fn compose_answer(result: &AnalysisResult) -> String {
    let mut answer = format!("Analysis for {}:", result.asset);
    for summary in &result.summaries {
        answer.push_str(&format!(
            " {} averaged {:.2} (range {:.2}-{:.2}, n={}).",
            summary.metric, summary.mean, summary.min, summary.max, summary.count
        ));
    }
    if result.anomalies.is_empty() {
        answer.push_str(" No anomalies detected.");
    } else {
        answer.push_str(&format!(
            " {} anomalous reading(s) detected.",
            result.anomalies.len()
        ));
    }
    answer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::AgentName;
    use crate::messaging::payloads::MetricSummary;
    use crate::messaging::publisher::MessagePublisher;
    use crate::messaging::test_utils::MemoryPublisher;
    use crate::storage::MemoryStore;

    fn build_agent() -> (Arc<QueryAgent>, Arc<MemoryPublisher>, Arc<AgentCore>) {
        let publisher = Arc::new(MemoryPublisher::new("query"));
        let core = Arc::new(AgentCore::new(
            AgentName::try_new("query").unwrap(),
            Arc::clone(&publisher) as Arc<dyn MessagePublisher>,
        ));
        let sessions = Arc::new(SessionContextStore::with_default_ttl(Arc::new(
            MemoryStore::new(),
        )));
        let agent = Arc::new(QueryAgent::new(Arc::clone(&core), sessions));
        (agent, publisher, core)
    }

    fn query_request(session_id: &str, query: &str) -> QueryRequest {
        QueryRequest {
            metadata: crate::messaging::envelope::MessageMetadata::new(
                &AgentName::try_new("gateway").unwrap(),
                None,
                None,
            ),
            session_id: session_id.to_string(),
            query: query.to_string(),
        }
    }

    #[test]
    fn test_intent_classification() {
        assert_eq!(
            classify_intent("what is the price of ZEC").intent_type,
            IntentType::PriceCheck
        );
        assert_eq!(
            classify_intent("show the volume trend this week").intent_type,
            IntentType::TrendAnalysis
        );
        assert_eq!(
            classify_intent("compare ZEC against BTC").intent_type,
            IntentType::Comparison
        );
        assert_eq!(
            classify_intent("was there a sudden spike today").intent_type,
            IntentType::AnomalyInvestigation
        );
        assert_eq!(
            classify_intent("tell me about zcash").intent_type,
            IntentType::General
        );
    }

    #[test]
    fn test_intent_time_range_parsing() {
        assert!(classify_intent("price today").time_range.is_some());
        let week = classify_intent("volume this week").time_range.unwrap();
        assert_eq!(week.end_ms - week.start_ms, 7 * DAY_MS);
        assert!(classify_intent("price").time_range.is_none());
    }

    #[test]
    fn test_entity_extraction() {
        let entities = extract_entities("compare ZEC and btc price");
        let assets: Vec<&str> = entities
            .iter()
            .filter(|e| e.entity_type == EntityType::Asset)
            .map(|e| e.value.as_str())
            .collect();
        assert_eq!(assets, vec!["ZEC", "BTC"]);
        assert!(entities
            .iter()
            .any(|e| e.entity_type == EntityType::Metric && e.value == "price"));
    }

    #[tokio::test]
    async fn test_query_request_fans_out_tracked_retrieval() {
        let (agent, publisher, core) = build_agent();
        agent
            .handle_query_request(query_request("s1", "what is the ZEC price today"))
            .await
            .unwrap();

        let published = publisher.published_on(routing_keys::DATA_RETRIEVAL_REQUEST);
        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0].options.reply_to.as_deref(),
            Some(routing_keys::ANALYSIS_RESULT)
        );

        let request: DataRetrievalRequest = serde_json::from_slice(&published[0].body).unwrap();
        assert_eq!(request.asset, "ZEC");
        assert_eq!(request.metrics, vec!["price"]);

        // Exactly one outstanding correlation entry carrying the session
        assert_eq!(core.outstanding_correlations(), 1);
        let correlation_id = published[0].options.correlation_id.clone().unwrap();
        let entry = core.get_correlation_context(&correlation_id).unwrap();
        assert_eq!(entry.context.get("session_id").unwrap(), "s1");
        assert_eq!(entry.reply_routing_key, routing_keys::ANALYSIS_RESULT);
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected() {
        let (agent, _publisher, _core) = build_agent();
        let err = agent
            .handle_query_request(query_request("s1", "   "))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_analysis_result_closes_the_loop() {
        let (agent, publisher, core) = build_agent();
        agent
            .handle_query_request(query_request("s1", "zec price today"))
            .await
            .unwrap();
        let correlation_id = publisher.published()[0]
            .options
            .correlation_id
            .clone()
            .unwrap();
        publisher.clear();

        let result = AnalysisResult {
            metadata: core.metadata(Some(correlation_id.clone())),
            asset: "ZEC".to_string(),
            summaries: vec![MetricSummary {
                metric: "price".to_string(),
                count: 24,
                mean: 31.5,
                min: 29.0,
                max: 34.0,
                std_dev: 1.2,
            }],
            anomalies: vec![],
        };
        let props = DeliveryProps {
            routing_key: routing_keys::ANALYSIS_RESULT.to_string(),
            correlation_id: Some(correlation_id.clone()),
            ..Default::default()
        };
        agent.handle_analysis_result(result, props).await.unwrap();

        let responses = publisher.published_on(routing_keys::QUERY_RESPONSE);
        assert_eq!(responses.len(), 1);
        let response: QueryResponse = serde_json::from_slice(&responses[0].body).unwrap();
        assert_eq!(response.session_id, "s1");
        assert!(response.answer.contains("31.50"));

        // Follow-up request rides the same correlation
        let followups = publisher.published_on(routing_keys::FOLLOWUP_REQUEST);
        assert_eq!(followups.len(), 1);
        assert_eq!(
            followups[0].options.correlation_id.as_ref(),
            Some(&correlation_id)
        );

        // Correlation entry consumed
        assert!(core.get_correlation_context(&correlation_id).is_none());
    }

    #[tokio::test]
    async fn test_orphan_analysis_result_is_tolerated() {
        let (agent, publisher, core) = build_agent();
        let orphan = crate::domain_types::CorrelationId::generate();
        let result = AnalysisResult {
            metadata: core.metadata(Some(orphan.clone())),
            asset: "ZEC".to_string(),
            summaries: vec![],
            anomalies: vec![],
        };
        let props = DeliveryProps {
            routing_key: routing_keys::ANALYSIS_RESULT.to_string(),
            correlation_id: Some(orphan),
            ..Default::default()
        };
        agent.handle_analysis_result(result, props).await.unwrap();
        assert!(publisher.published().is_empty());
    }
}
