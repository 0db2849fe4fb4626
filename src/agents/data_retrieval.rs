//! Data retrieval agent
//!
//! Fetches metric observations from an upstream market-data source,
//! shielded by the full resilience stack (timeout innermost, retry, then
//! the circuit breaker), with a short-lived response cache in front.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::errors::{ChimeraError, ErrorCode};
use crate::messaging::agent::AgentCore;
use crate::messaging::payloads::{
    routing_keys, DataRetrievalRequest, DataRetrievalResponse, MetricPoint, MetricValue, TimeRange,
};
use crate::messaging::registry::HandlerRegistry;
use crate::resilience::{with_timeout, CircuitBreaker, RetryPolicy};

/// An upstream origin of market data. Collaborator contract only; the
/// core sees nothing but typed observations.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Source name for breaker naming and response attribution.
    fn name(&self) -> &str;

    /// Fetches observations for an asset's metrics over a window.
    async fn fetch(
        &self,
        asset: &str,
        metrics: &[String],
        time_range: &TimeRange,
    ) -> Result<Vec<MetricPoint>, ChimeraError>;
}

/// Deterministic in-process source used for development and tests:
/// hourly points derived from the asset symbol and window.
pub struct SyntheticMarketData;

#[async_trait]
impl MarketDataSource for SyntheticMarketData {
    fn name(&self) -> &str {
        "synthetic"
    }

    async fn fetch(
        &self,
        asset: &str,
        metrics: &[String],
        time_range: &TimeRange,
    ) -> Result<Vec<MetricPoint>, ChimeraError> {
        const HOUR_MS: i64 = 3_600_000;
        let base: f64 = asset.bytes().map(f64::from).sum();
        let mut points = Vec::new();
        for metric in metrics {
            let metric_offset: f64 = metric.bytes().map(f64::from).sum();
            let mut timestamp_ms = time_range.start_ms;
            let mut step = 0u32;
            while timestamp_ms < time_range.end_ms {
                let wobble = f64::from(step % 7) - 3.0;
                points.push(MetricPoint {
                    metric: metric.clone(),
                    value: MetricValue::Number(base + metric_offset / 10.0 + wobble),
                    timestamp_ms,
                });
                timestamp_ms += HOUR_MS;
                step += 1;
            }
        }
        Ok(points)
    }
}

struct CachedResponse {
    points: Vec<MetricPoint>,
    inserted_at: Instant,
}

/// The data retrieval agent.
pub struct DataRetrievalAgent {
    core: Arc<AgentCore>,
    source: Arc<dyn MarketDataSource>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    fetch_timeout: Duration,
    cache: DashMap<String, CachedResponse>,
    cache_ttl: Duration,
}

impl DataRetrievalAgent {
    /// Creates the agent around a market-data source.
    #[must_use]
    pub fn new(core: Arc<AgentCore>, source: Arc<dyn MarketDataSource>) -> Self {
        let breaker = crate::resilience::global_registry().get_or_create(
            &format!("market-data:{}", source.name()),
            5,
            Duration::from_secs(60),
        );
        Self {
            core,
            source,
            breaker,
            retry: RetryPolicy::exponential(3, Duration::from_millis(500)),
            fetch_timeout: Duration::from_secs(10),
            cache: DashMap::new(),
            cache_ttl: Duration::from_secs(60),
        }
    }

    /// Overrides the resilience knobs (tests use tight budgets).
    #[must_use]
    pub fn with_resilience(
        mut self,
        retry: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
        fetch_timeout: Duration,
    ) -> Self {
        self.retry = retry;
        self.breaker = breaker;
        self.fetch_timeout = fetch_timeout;
        self
    }

    fn cache_key(request: &DataRetrievalRequest) -> String {
        format!(
            "{}|{}|{}|{}",
            request.asset,
            request.metrics.join(","),
            request.time_range.start_ms,
            request.time_range.end_ms
        )
    }

    async fn fetch_resilient(
        &self,
        request: &DataRetrievalRequest,
    ) -> Result<Vec<MetricPoint>, ChimeraError> {
        // Timeout innermost, retry around it, breaker outermost
        self.breaker
            .call(|| {
                self.retry.run(|| {
                    with_timeout(
                        self.fetch_timeout,
                        self.source
                            .fetch(&request.asset, &request.metrics, &request.time_range),
                    )
                })
            })
            .await
    }

    /// Handles one retrieval request: cache hit or resilient fetch, then
    /// a response under the caller's correlation ID.
    ///
    /// # Errors
    /// Upstream failures propagate (and dead-letter the request) after
    /// the resilience stack is exhausted.
    pub async fn handle_retrieval_request(
        &self,
        request: DataRetrievalRequest,
        correlation_id: Option<crate::domain_types::CorrelationId>,
    ) -> Result<(), ChimeraError> {
        if request.metrics.is_empty() {
            return Err(ChimeraError::user("retrieval request names no metrics")
                .with_code(ErrorCode::InvalidInput));
        }

        let key = Self::cache_key(&request);
        let cached = self.cache.get(&key).and_then(|entry| {
            if entry.inserted_at.elapsed() < self.cache_ttl {
                Some(entry.points.clone())
            } else {
                None
            }
        });

        let (points, from_cache) = match cached {
            Some(points) => {
                debug!(asset = %request.asset, "serving retrieval from cache");
                (points, true)
            }
            None => {
                let points = self.fetch_resilient(&request).await?;
                self.cache.insert(
                    key,
                    CachedResponse {
                        points: points.clone(),
                        inserted_at: Instant::now(),
                    },
                );
                (points, false)
            }
        };

        let correlation_id =
            correlation_id.unwrap_or_else(|| request.metadata.correlation_id.clone());
        let response = DataRetrievalResponse {
            metadata: self.core.metadata(Some(correlation_id.clone())),
            asset: request.asset.clone(),
            points,
            source: self.source.name().to_string(),
        };
        self.core
            .publish_response(&response, routing_keys::DATA_RETRIEVAL_RESPONSE, &correlation_id)
            .await?;
        info!(
            asset = %request.asset,
            from_cache,
            correlation_id = %correlation_id,
            "retrieval response published"
        );
        Ok(())
    }

    /// Builds the routing-key map for this agent.
    #[must_use]
    pub fn registry(self: &Arc<Self>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        let agent = Arc::clone(self);
        registry.on::<DataRetrievalRequest, _, _>(
            routing_keys::DATA_RETRIEVAL_REQUEST,
            move |request, props| {
                let agent = Arc::clone(&agent);
                async move {
                    agent
                        .handle_retrieval_request(request, props.correlation_id)
                        .await
                }
            },
        );
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{AgentName, CorrelationId};
    use crate::messaging::envelope::MessageMetadata;
    use crate::messaging::publisher::MessagePublisher;
    use crate::messaging::test_utils::MemoryPublisher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakySource {
        calls: AtomicUsize,
        failures_before_success: usize,
    }

    #[async_trait]
    impl MarketDataSource for FlakySource {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn fetch(
            &self,
            _asset: &str,
            metrics: &[String],
            time_range: &TimeRange,
        ) -> Result<Vec<MetricPoint>, ChimeraError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                return Err(ChimeraError::data_source("flaky", "connection reset"));
            }
            Ok(vec![MetricPoint {
                metric: metrics[0].clone(),
                value: MetricValue::Number(42.0),
                timestamp_ms: time_range.start_ms,
            }])
        }
    }

    fn build_agent(source: Arc<dyn MarketDataSource>) -> (Arc<DataRetrievalAgent>, Arc<MemoryPublisher>) {
        let publisher = Arc::new(MemoryPublisher::new("data_retrieval"));
        let core = Arc::new(AgentCore::new(
            AgentName::try_new("data_retrieval").unwrap(),
            Arc::clone(&publisher) as Arc<dyn MessagePublisher>,
        ));
        let agent = DataRetrievalAgent::new(core, source).with_resilience(
            RetryPolicy::constant(3, Duration::from_millis(1)).with_jitter(false),
            Arc::new(CircuitBreaker::new("test-source", 10, Duration::from_secs(1))),
            Duration::from_secs(1),
        );
        (Arc::new(agent), publisher)
    }

    fn request(asset: &str, metrics: &[&str]) -> DataRetrievalRequest {
        DataRetrievalRequest {
            metadata: MessageMetadata::new(&AgentName::try_new("query").unwrap(), None, None),
            asset: asset.to_string(),
            metrics: metrics.iter().map(|m| (*m).to_string()).collect(),
            time_range: TimeRange {
                start_ms: 0,
                end_ms: 7_200_000,
            },
        }
    }

    #[tokio::test]
    async fn test_successful_retrieval_publishes_response() {
        let (agent, publisher) = build_agent(Arc::new(SyntheticMarketData));
        let correlation_id = CorrelationId::generate();
        agent
            .handle_retrieval_request(request("ZEC", &["price"]), Some(correlation_id.clone()))
            .await
            .unwrap();

        let responses = publisher.published_on(routing_keys::DATA_RETRIEVAL_RESPONSE);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].options.correlation_id.as_ref(), Some(&correlation_id));

        let response: DataRetrievalResponse = serde_json::from_slice(&responses[0].body).unwrap();
        assert_eq!(response.asset, "ZEC");
        assert_eq!(response.source, "synthetic");
        assert_eq!(response.points.len(), 2);
    }

    #[tokio::test]
    async fn test_transient_source_failure_is_retried() {
        let source = Arc::new(FlakySource {
            calls: AtomicUsize::new(0),
            failures_before_success: 2,
        });
        let (agent, publisher) = build_agent(Arc::clone(&source) as Arc<dyn MarketDataSource>);

        agent
            .handle_retrieval_request(request("BTC", &["price"]), None)
            .await
            .unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn test_cache_serves_repeat_requests() {
        let source = Arc::new(FlakySource {
            calls: AtomicUsize::new(0),
            failures_before_success: 0,
        });
        let (agent, publisher) = build_agent(Arc::clone(&source) as Arc<dyn MarketDataSource>);

        agent
            .handle_retrieval_request(request("BTC", &["price"]), None)
            .await
            .unwrap();
        agent
            .handle_retrieval_request(request("BTC", &["price"]), None)
            .await
            .unwrap();

        // Second request never reached the source
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.published().len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_propagate_for_dead_lettering() {
        let source = Arc::new(FlakySource {
            calls: AtomicUsize::new(0),
            failures_before_success: 99,
        });
        let (agent, publisher) = build_agent(source);

        let err = agent
            .handle_retrieval_request(request("BTC", &["price"]), None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_request_without_metrics_is_user_error() {
        let (agent, _publisher) = build_agent(Arc::new(SyntheticMarketData));
        let err = agent
            .handle_retrieval_request(request("ZEC", &[]), None)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
