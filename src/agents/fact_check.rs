//! Fact-checker agent
//!
//! Re-fetches the data behind each claim and compares within a relative
//! tolerance, publishing a verdict set under the chain's correlation ID.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::agents::data_retrieval::MarketDataSource;
use crate::domain_types::{epoch_millis, CorrelationId};
use crate::errors::ChimeraError;
use crate::messaging::agent::AgentCore;
use crate::messaging::payloads::{
    routing_keys, Claim, ClaimVerdict, FactCheckRequest, FactCheckResult, TimeRange,
};
use crate::messaging::registry::HandlerRegistry;
use crate::resilience::with_timeout;

/// Default relative tolerance for a claim to verify.
const DEFAULT_TOLERANCE: f64 = 0.05;

const DAY_MS: i64 = 86_400_000;

/// The fact-checker agent.
pub struct FactCheckAgent {
    core: Arc<AgentCore>,
    source: Arc<dyn MarketDataSource>,
    tolerance: f64,
    fetch_timeout: Duration,
}

impl FactCheckAgent {
    /// Creates the agent around an independent data source.
    #[must_use]
    pub fn new(core: Arc<AgentCore>, source: Arc<dyn MarketDataSource>) -> Self {
        Self {
            core,
            source,
            tolerance: DEFAULT_TOLERANCE,
            fetch_timeout: Duration::from_secs(10),
        }
    }

    /// Overrides the verification tolerance.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    async fn verify_claim(&self, claim: &Claim) -> ClaimVerdict {
        let now = epoch_millis();
        let window = TimeRange {
            start_ms: now - DAY_MS,
            end_ms: now,
        };
        let metrics = vec![claim.metric.clone()];
        let fetched = with_timeout(
            self.fetch_timeout,
            self.source.fetch(&claim.asset, &metrics, &window),
        )
        .await;

        match fetched {
            Err(err) => ClaimVerdict {
                claim: claim.clone(),
                verified: false,
                observed_value: None,
                note: Some(format!("verification source unavailable: {err}")),
            },
            Ok(points) => {
                let values: Vec<f64> = points
                    .iter()
                    .filter(|point| point.metric == claim.metric)
                    .filter_map(|point| point.value.as_number())
                    .collect();
                if values.is_empty() {
                    return ClaimVerdict {
                        claim: claim.clone(),
                        verified: false,
                        observed_value: None,
                        note: Some("no observations for claimed metric".to_string()),
                    };
                }
                let observed = values.iter().sum::<f64>() / values.len() as f64;
                let scale = claim.claimed_value.abs().max(f64::EPSILON);
                let deviation = (observed - claim.claimed_value).abs() / scale;
                ClaimVerdict {
                    claim: claim.clone(),
                    verified: deviation <= self.tolerance,
                    observed_value: Some(observed),
                    note: (deviation > self.tolerance)
                        .then(|| format!("observed value deviates {:.1}%", deviation * 100.0)),
                }
            }
        }
    }

    /// Verifies every claim in a request and publishes the verdicts.
    ///
    /// # Errors
    /// Propagates publish failures. Per-claim source failures become
    /// unverified verdicts, not handler failures.
    pub async fn handle_fact_check(
        &self,
        request: FactCheckRequest,
        correlation_id: Option<CorrelationId>,
    ) -> Result<(), ChimeraError> {
        let mut verdicts = Vec::with_capacity(request.claims.len());
        for claim in &request.claims {
            verdicts.push(self.verify_claim(claim).await);
        }
        let verified = verdicts.iter().filter(|verdict| verdict.verified).count();

        let correlation_id =
            correlation_id.unwrap_or_else(|| request.metadata.correlation_id.clone());
        let result = FactCheckResult {
            metadata: self.core.metadata(Some(correlation_id.clone())),
            verdicts,
        };
        self.core
            .publish_response(&result, routing_keys::FACT_CHECK_RESULT, &correlation_id)
            .await?;
        info!(
            claims = request.claims.len(),
            verified,
            correlation_id = %correlation_id,
            "fact-check verdicts published"
        );
        Ok(())
    }

    /// Builds the routing-key map for this agent.
    #[must_use]
    pub fn registry(self: &Arc<Self>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        let agent = Arc::clone(self);
        registry.on::<FactCheckRequest, _, _>(
            routing_keys::FACT_CHECK_REQUEST,
            move |request, props| {
                let agent = Arc::clone(&agent);
                async move { agent.handle_fact_check(request, props.correlation_id).await }
            },
        );
        registry
    }
}
