//! Analysis agent
//!
//! Turns raw observations into summary statistics and threshold
//! anomalies, publishing the result bundle under the chain's correlation
//! ID for the query agent (and narrative agent) to consume.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::domain_types::CorrelationId;
use crate::errors::{ChimeraError, ErrorCode};
use crate::messaging::agent::AgentCore;
use crate::messaging::payloads::{
    routing_keys, AnalysisRequest, AnalysisResult, Anomaly, DataRetrievalResponse, MetricPoint,
    MetricSummary,
};
use crate::messaging::registry::HandlerRegistry;

/// Readings beyond this many standard deviations are anomalous.
const ANOMALY_Z_THRESHOLD: f64 = 2.0;

/// Computes per-metric summary statistics over numeric observations.
#[must_use]
pub fn summarize(points: &[MetricPoint]) -> Vec<MetricSummary> {
    let mut grouped: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for point in points {
        if let Some(value) = point.value.as_number() {
            grouped.entry(&point.metric).or_default().push(value);
        }
    }

    grouped
        .into_iter()
        .map(|(metric, values)| {
            let count = values.len();
            let mean = values.iter().sum::<f64>() / count as f64;
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let variance = values
                .iter()
                .map(|value| (value - mean).powi(2))
                .sum::<f64>()
                / count as f64;
            MetricSummary {
                metric: metric.to_string(),
                count,
                mean,
                min,
                max,
                std_dev: variance.sqrt(),
            }
        })
        .collect()
}

/// Flags observations deviating beyond the z-score threshold from their
/// metric's mean.
#[must_use]
pub fn detect_anomalies(points: &[MetricPoint], summaries: &[MetricSummary]) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    for summary in summaries {
        if summary.std_dev <= f64::EPSILON {
            continue;
        }
        for point in points.iter().filter(|p| p.metric == summary.metric) {
            let Some(value) = point.value.as_number() else {
                continue;
            };
            let score = (value - summary.mean) / summary.std_dev;
            if score.abs() > ANOMALY_Z_THRESHOLD {
                anomalies.push(Anomaly {
                    metric: summary.metric.clone(),
                    timestamp_ms: point.timestamp_ms,
                    value,
                    score,
                    description: format!(
                        "{} reading {:.2} deviates {:.1} std devs from mean {:.2}",
                        summary.metric, value, score, summary.mean
                    ),
                });
            }
        }
    }
    anomalies
}

/// The analysis agent.
pub struct AnalysisAgent {
    core: Arc<AgentCore>,
}

impl AnalysisAgent {
    /// Creates the agent.
    #[must_use]
    pub fn new(core: Arc<AgentCore>) -> Self {
        Self { core }
    }

    /// Analyzes observations and publishes the result bundle.
    ///
    /// # Errors
    /// An empty observation set is a non-retryable insufficient-data
    /// error; publish failures propagate.
    pub async fn analyze_and_publish(
        &self,
        asset: &str,
        points: &[MetricPoint],
        correlation_id: Option<CorrelationId>,
    ) -> Result<(), ChimeraError> {
        let numeric_count = points
            .iter()
            .filter(|point| point.value.as_number().is_some())
            .count();
        if numeric_count == 0 {
            return Err(ChimeraError::analysis("no numeric observations to analyze")
                .with_code(ErrorCode::InsufficientData));
        }

        let summaries = summarize(points);
        let anomalies = detect_anomalies(points, &summaries);
        let correlation_id = correlation_id.unwrap_or_else(CorrelationId::generate);

        let result = AnalysisResult {
            metadata: self.core.metadata(Some(correlation_id.clone())),
            asset: asset.to_string(),
            summaries,
            anomalies,
        };
        self.core
            .publish_response(&result, routing_keys::ANALYSIS_RESULT, &correlation_id)
            .await?;
        info!(
            asset,
            observations = numeric_count,
            anomalies = result.anomalies.len(),
            correlation_id = %correlation_id,
            "analysis result published"
        );
        Ok(())
    }

    /// Builds the routing-key map for this agent.
    #[must_use]
    pub fn registry(self: &Arc<Self>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();

        let agent = Arc::clone(self);
        registry.on::<DataRetrievalResponse, _, _>(
            routing_keys::DATA_RETRIEVAL_RESPONSE,
            move |response, props| {
                let agent = Arc::clone(&agent);
                async move {
                    agent
                        .analyze_and_publish(&response.asset, &response.points, props.correlation_id)
                        .await
                }
            },
        );

        let agent = Arc::clone(self);
        registry.on::<AnalysisRequest, _, _>(routing_keys::ANALYSIS_REQUEST, move |request, props| {
            let agent = Arc::clone(&agent);
            async move {
                agent
                    .analyze_and_publish(&request.asset, &request.points, props.correlation_id)
                    .await
            }
        });

        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::AgentName;
    use crate::messaging::payloads::MetricValue;
    use crate::messaging::publisher::MessagePublisher;
    use crate::messaging::test_utils::MemoryPublisher;

    fn point(metric: &str, value: f64, timestamp_ms: i64) -> MetricPoint {
        MetricPoint {
            metric: metric.to_string(),
            value: MetricValue::Number(value),
            timestamp_ms,
        }
    }

    fn build_agent() -> (Arc<AnalysisAgent>, Arc<MemoryPublisher>) {
        let publisher = Arc::new(MemoryPublisher::new("analysis"));
        let core = Arc::new(AgentCore::new(
            AgentName::try_new("analysis").unwrap(),
            Arc::clone(&publisher) as Arc<dyn MessagePublisher>,
        ));
        (Arc::new(AnalysisAgent::new(core)), publisher)
    }

    #[test]
    fn test_summarize_computes_per_metric_statistics() {
        let points = vec![
            point("price", 10.0, 0),
            point("price", 20.0, 1),
            point("price", 30.0, 2),
            point("volume", 100.0, 0),
        ];
        let summaries = summarize(&points);
        assert_eq!(summaries.len(), 2);

        let price = summaries.iter().find(|s| s.metric == "price").unwrap();
        assert_eq!(price.count, 3);
        assert!((price.mean - 20.0).abs() < 1e-9);
        assert_eq!(price.min, 10.0);
        assert_eq!(price.max, 30.0);
        assert!((price.std_dev - 8.164_965_809_277_26).abs() < 1e-9);
    }

    #[test]
    fn test_summarize_skips_non_numeric_values() {
        let points = vec![
            point("price", 10.0, 0),
            MetricPoint {
                metric: "price".to_string(),
                value: MetricValue::Absent,
                timestamp_ms: 1,
            },
        ];
        let summaries = summarize(&points);
        assert_eq!(summaries[0].count, 1);
    }

    #[test]
    fn test_detect_anomalies_flags_outliers() {
        let mut points: Vec<MetricPoint> =
            (0..20).map(|i| point("price", 100.0 + (i % 3) as f64, i)).collect();
        points.push(point("price", 500.0, 99));

        let summaries = summarize(&points);
        let anomalies = detect_anomalies(&points, &summaries);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].value, 500.0);
        assert!(anomalies[0].score > ANOMALY_Z_THRESHOLD);
    }

    #[test]
    fn test_constant_series_has_no_anomalies() {
        let points: Vec<MetricPoint> = (0..10).map(|i| point("price", 5.0, i)).collect();
        let summaries = summarize(&points);
        assert!(detect_anomalies(&points, &summaries).is_empty());
    }

    #[tokio::test]
    async fn test_analyze_publishes_result_with_correlation() {
        let (agent, publisher) = build_agent();
        let correlation_id = CorrelationId::generate();
        let points = vec![point("price", 10.0, 0), point("price", 12.0, 1)];

        agent
            .analyze_and_publish("ZEC", &points, Some(correlation_id.clone()))
            .await
            .unwrap();

        let published = publisher.published_on(routing_keys::ANALYSIS_RESULT);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].options.correlation_id.as_ref(), Some(&correlation_id));
        let result: AnalysisResult = serde_json::from_slice(&published[0].body).unwrap();
        assert_eq!(result.asset, "ZEC");
        assert_eq!(result.summaries.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_observations_are_insufficient_data() {
        let (agent, publisher) = build_agent();
        let err = agent
            .analyze_and_publish("ZEC", &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InsufficientData);
        assert!(!err.is_retryable());
        assert!(publisher.published().is_empty());
    }
}
