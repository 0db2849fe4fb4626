//! Follow-up agent
//!
//! Derives a small ranked set of follow-up questions from the answered
//! query's intent and the session's recent focus.

use std::sync::Arc;

use tracing::info;

use crate::domain_types::CorrelationId;
use crate::errors::ChimeraError;
use crate::messaging::agent::AgentCore;
use crate::messaging::payloads::{
    routing_keys, FollowUpRequest, FollowUpSuggestions, IntentType,
};
use crate::messaging::registry::HandlerRegistry;
use crate::session::SessionContextStore;

/// Maximum suggestions returned per request.
const MAX_SUGGESTIONS: usize = 3;

/// Generates candidate follow-ups for an answered query.
#[must_use]
pub fn generate_suggestions(request: &FollowUpRequest, recent_metrics: &[String]) -> Vec<String> {
    let mut suggestions = Vec::new();

    match request.intent.intent_type {
        IntentType::PriceCheck => {
            suggestions.push("How has the price moved over the last week?".to_string());
            suggestions.push("How does trading volume compare to the price trend?".to_string());
        }
        IntentType::TrendAnalysis => {
            suggestions.push("Were there any anomalies in this period?".to_string());
            suggestions.push("How does this trend compare to BTC?".to_string());
        }
        IntentType::Comparison => {
            suggestions.push("Which of these assets was more volatile?".to_string());
            suggestions.push("Show the same comparison over a longer window.".to_string());
        }
        IntentType::AnomalyInvestigation => {
            suggestions.push("What happened to volume around the anomaly?".to_string());
            suggestions.push("Set up an alert for the next spike.".to_string());
        }
        IntentType::General => {
            suggestions.push("What is the current price?".to_string());
            suggestions.push("Show the volume trend this week.".to_string());
        }
    }

    for metric in recent_metrics {
        let candidate = format!("Dig deeper into {metric} for this period?");
        if !request.intent.metrics.contains(metric) && !suggestions.contains(&candidate) {
            suggestions.push(candidate);
        }
    }

    suggestions.truncate(MAX_SUGGESTIONS);
    suggestions
}

/// The follow-up agent.
pub struct FollowUpAgent {
    core: Arc<AgentCore>,
    sessions: Arc<SessionContextStore>,
}

impl FollowUpAgent {
    /// Creates the agent.
    #[must_use]
    pub fn new(core: Arc<AgentCore>, sessions: Arc<SessionContextStore>) -> Self {
        Self { core, sessions }
    }

    /// Produces suggestions for one answered query.
    ///
    /// # Errors
    /// Propagates session-store and publish failures.
    pub async fn handle_followup_request(
        &self,
        request: FollowUpRequest,
        correlation_id: Option<CorrelationId>,
    ) -> Result<(), ChimeraError> {
        let context = self
            .sessions
            .extract_for_query(&request.session_id, &request.query)
            .await?;
        let suggestions = generate_suggestions(&request, &context.metrics);

        let correlation_id =
            correlation_id.unwrap_or_else(|| request.metadata.correlation_id.clone());
        let response = FollowUpSuggestions {
            metadata: self.core.metadata(Some(correlation_id.clone())),
            session_id: request.session_id.clone(),
            suggestions,
        };
        self.core
            .publish_response(&response, routing_keys::FOLLOWUP_SUGGESTIONS, &correlation_id)
            .await?;
        info!(
            session_id = %request.session_id,
            correlation_id = %correlation_id,
            "follow-up suggestions published"
        );
        Ok(())
    }

    /// Builds the routing-key map for this agent.
    #[must_use]
    pub fn registry(self: &Arc<Self>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        let agent = Arc::clone(self);
        registry.on::<FollowUpRequest, _, _>(
            routing_keys::FOLLOWUP_REQUEST,
            move |request, props| {
                let agent = Arc::clone(&agent);
                async move {
                    agent
                        .handle_followup_request(request, props.correlation_id)
                        .await
                }
            },
        );
        registry
    }
}
