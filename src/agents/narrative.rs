//! Narrative agent
//!
//! Renders analysis results into prose. An LLM collaborator produces the
//! text when configured; the deterministic template is the fallback, so
//! narrative generation degrades gracefully when the model is
//! unavailable. Claims worth verifying are handed to the fact checker.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::domain_types::CorrelationId;
use crate::errors::ChimeraError;
use crate::messaging::agent::AgentCore;
use crate::messaging::payloads::{
    routing_keys, AnalysisResult, Anomaly, Claim, FactCheckRequest, MetricSummary,
    NarrativeGenerated, NarrativeRequest,
};
use crate::messaging::registry::HandlerRegistry;
use crate::resilience::with_fallback;

/// A text-generation collaborator. The core only ever sees the prompt
/// and the completion.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model identifier for response attribution.
    fn model(&self) -> &str;

    /// Completes a prompt.
    async fn complete(&self, prompt: &str) -> Result<String, ChimeraError>;
}

/// Renders a narrative without any model.
#[must_use]
pub fn render_template(asset: &str, summaries: &[MetricSummary], anomalies: &[Anomaly]) -> String {
    let mut narrative = format!("Market report for {asset}.");
    for summary in summaries {
        narrative.push_str(&format!(
            " Over {} observations, {} averaged {:.2}, ranging from {:.2} to {:.2}.",
            summary.count, summary.metric, summary.mean, summary.min, summary.max
        ));
    }
    match anomalies.len() {
        0 => narrative.push_str(" No unusual readings were observed."),
        1 => narrative.push_str(&format!(" One unusual reading: {}.", anomalies[0].description)),
        n => narrative.push_str(&format!(" {n} unusual readings were observed.")),
    }
    narrative
}

fn build_prompt(asset: &str, summaries: &[MetricSummary], anomalies: &[Anomaly]) -> String {
    let mut prompt = format!(
        "Write a short market report for {asset} based on these statistics:\n"
    );
    for summary in summaries {
        prompt.push_str(&format!(
            "- {}: mean {:.2}, min {:.2}, max {:.2}, n={}\n",
            summary.metric, summary.mean, summary.min, summary.max, summary.count
        ));
    }
    for anomaly in anomalies {
        prompt.push_str(&format!("- anomaly: {}\n", anomaly.description));
    }
    prompt
}

/// The narrative agent.
pub struct NarrativeAgent {
    core: Arc<AgentCore>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl NarrativeAgent {
    /// Creates the agent. Without an LLM client every narrative comes
    /// from the template.
    #[must_use]
    pub fn new(core: Arc<AgentCore>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { core, llm }
    }

    async fn render(
        &self,
        asset: &str,
        summaries: &[MetricSummary],
        anomalies: &[Anomaly],
    ) -> (String, String) {
        match &self.llm {
            None => (render_template(asset, summaries, anomalies), "template".to_string()),
            Some(llm) => {
                let prompt = build_prompt(asset, summaries, anomalies);
                let generated = with_fallback(
                    || async { llm.complete(&prompt).await },
                    || async { Ok(render_template(asset, summaries, anomalies)) },
                )
                .await;
                match generated {
                    Ok(text) if !text.trim().is_empty() => (text, llm.model().to_string()),
                    _ => (render_template(asset, summaries, anomalies), "template".to_string()),
                }
            }
        }
    }

    /// Renders a narrative, publishes it, and requests fact checking of
    /// the mean-value claims it makes.
    ///
    /// # Errors
    /// Propagates publish failures.
    pub async fn narrate_and_publish(
        &self,
        asset: &str,
        summaries: &[MetricSummary],
        anomalies: &[Anomaly],
        correlation_id: Option<CorrelationId>,
    ) -> Result<(), ChimeraError> {
        let correlation_id = correlation_id.unwrap_or_else(CorrelationId::generate);
        let (narrative, generator) = self.render(asset, summaries, anomalies).await;

        let generated = NarrativeGenerated {
            metadata: self.core.metadata(Some(correlation_id.clone())),
            narrative,
            generator,
        };
        self.core
            .publish_response(&generated, routing_keys::NARRATIVE_GENERATED, &correlation_id)
            .await?;

        let claims: Vec<Claim> = summaries
            .iter()
            .map(|summary| Claim {
                asset: asset.to_string(),
                metric: summary.metric.clone(),
                claimed_value: summary.mean,
            })
            .collect();
        if !claims.is_empty() {
            let fact_check = FactCheckRequest {
                metadata: self.core.metadata(Some(correlation_id.clone())),
                claims,
            };
            self.core
                .publish_event(
                    &fact_check,
                    routing_keys::FACT_CHECK_REQUEST,
                    Some(correlation_id.clone()),
                )
                .await?;
        }

        info!(asset, correlation_id = %correlation_id, "narrative published");
        Ok(())
    }

    /// Builds the routing-key map for this agent.
    #[must_use]
    pub fn registry(self: &Arc<Self>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();

        let agent = Arc::clone(self);
        registry.on::<NarrativeRequest, _, _>(
            routing_keys::NARRATIVE_REQUEST,
            move |request, props| {
                let agent = Arc::clone(&agent);
                async move {
                    agent
                        .narrate_and_publish(
                            &request.asset,
                            &request.summaries,
                            &request.anomalies,
                            props.correlation_id,
                        )
                        .await
                }
            },
        );

        let agent = Arc::clone(self);
        registry.on::<AnalysisResult, _, _>(routing_keys::ANALYSIS_RESULT, move |result, props| {
            let agent = Arc::clone(&agent);
            async move {
                agent
                    .narrate_and_publish(
                        &result.asset,
                        &result.summaries,
                        &result.anomalies,
                        props.correlation_id,
                    )
                    .await
            }
        });

        registry
    }
}
