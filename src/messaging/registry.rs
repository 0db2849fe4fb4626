//! Routing-key dispatch table
//!
//! Each agent declares a map from the routing-key patterns it consumes to
//! deserializing handler closures. Dispatch is total: a delivery whose
//! routing key matches no entry is a hard error for that delivery, which
//! sends it down the DLQ path. Patterns use topic semantics: `*` matches
//! exactly one dot-separated word, `#` matches zero or more.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::domain_types::CorrelationId;
use crate::errors::{ChimeraError, ErrorCode, ErrorKind};
use crate::messaging::envelope;

/// Broker-level properties of one delivery, minus the body.
#[derive(Debug, Clone, Default)]
pub struct DeliveryProps {
    /// The routing key the message arrived with.
    pub routing_key: String,
    /// Correlation ID from the message properties, when present.
    pub correlation_id: Option<CorrelationId>,
    /// Publishing agent (AMQP app-id), when present.
    pub sender: Option<String>,
    /// Reply-to hint from the message properties.
    pub reply_to: Option<String>,
    /// String-valued message headers, including trace context.
    pub headers: BTreeMap<String, String>,
    /// Whether the broker flagged the delivery as redelivered.
    pub redelivered: bool,
}

type BoxedHandler =
    Box<dyn Fn(Vec<u8>, DeliveryProps) -> BoxFuture<'static, Result<(), ChimeraError>> + Send + Sync>;

/// Ordered map of routing-key patterns to deserializing handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Vec<(String, BoxedHandler)>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a routing-key pattern. The payload is
    /// deserialized to `P` before the handler runs; a body that does not
    /// match the schema fails the delivery.
    pub fn on<P, F, Fut>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, DeliveryProps) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ChimeraError>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |body, props| {
            let parsed = envelope::deserialize::<P>(&body);
            let fut = parsed.map(|payload| handler(payload, props));
            Box::pin(async move { fut?.await })
        });
        self.entries.push((pattern.to_string(), boxed));
        self
    }

    /// The registered patterns, in registration order. These become the
    /// agent's queue bindings.
    #[must_use]
    pub fn patterns(&self) -> Vec<String> {
        self.entries.iter().map(|(pattern, _)| pattern.clone()).collect()
    }

    /// Whether any entry matches the routing key.
    #[must_use]
    pub fn matches(&self, routing_key: &str) -> bool {
        self.entries
            .iter()
            .any(|(pattern, _)| routing_key_matches(pattern, routing_key))
    }

    /// Dispatches one delivery to the first matching handler.
    ///
    /// # Errors
    /// Returns a non-retryable unknown-routing-key error when nothing
    /// matches, or the handler's own error.
    pub async fn dispatch(&self, body: Vec<u8>, props: DeliveryProps) -> Result<(), ChimeraError> {
        let handler = self
            .entries
            .iter()
            .find(|(pattern, _)| routing_key_matches(pattern, &props.routing_key))
            .map(|(_, handler)| handler)
            .ok_or_else(|| {
                ChimeraError::new(
                    ErrorKind::DataProcessing,
                    ErrorCode::UnknownRoutingKey,
                    format!("no handler for routing key '{}'", props.routing_key),
                    false,
                )
            })?;
        handler(body, props).await
    }
}

/// Topic-style pattern matching over dot-separated routing keys. `*`
/// matches exactly one word, `#` matches zero or more words.
#[must_use]
pub fn routing_key_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    let key_segments: Vec<&str> = routing_key.split('.').collect();
    match_segments(&pattern_segments, &key_segments)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // '#' absorbs zero or more words
            match_segments(rest, key) || (!key.is_empty() && match_segments(pattern, &key[1..]))
        }
        Some((&segment, rest)) => match key.split_first() {
            Some((&word, key_rest)) => {
                (segment == "*" || segment == word) && match_segments(rest, key_rest)
            }
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        value: u32,
    }

    fn props(routing_key: &str) -> DeliveryProps {
        DeliveryProps {
            routing_key: routing_key.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_routing_key_matching() {
        assert!(routing_key_matches("query.request", "query.request"));
        assert!(!routing_key_matches("query.request", "query.response"));

        assert!(routing_key_matches("query.*", "query.request"));
        assert!(!routing_key_matches("query.*", "query.request.extra"));

        assert!(routing_key_matches("#", "anything.at.all"));
        assert!(routing_key_matches("query.#", "query.request"));
        assert!(routing_key_matches("query.#", "query"));
        assert!(routing_key_matches("query.#", "query.request.v2"));
        assert!(!routing_key_matches("query.#", "analysis.request"));

        assert!(routing_key_matches("#.error", "query.error"));
        assert!(routing_key_matches("#.error", "deep.chain.error"));
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_matching_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = Arc::clone(&calls);
        registry.on::<Ping, _, _>("test.ping", move |ping, _props| {
            let counter = Arc::clone(&counter);
            async move {
                assert_eq!(ping.value, 7);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let body = serde_json::to_vec(&Ping { value: 7 }).unwrap();
        registry.dispatch(body, props("test.ping")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_routing_key_is_hard_error() {
        let mut registry = HandlerRegistry::new();
        registry.on::<Ping, _, _>("test.ping", |_ping, _props| async { Ok(()) });

        let err = registry
            .dispatch(b"{}".to_vec(), props("test.unknown"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownRoutingKey);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_schema_mismatch_fails_delivery() {
        let mut registry = HandlerRegistry::new();
        registry.on::<Ping, _, _>("test.ping", |_ping, _props| async { Ok(()) });

        let err = registry
            .dispatch(b"{\"value\":\"not a number\"}".to_vec(), props("test.ping"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_wildcard_subscription_dispatches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = Arc::clone(&calls);
        registry.on::<Ping, _, _>("monitoring.#", move |_ping, props| {
            let counter = Arc::clone(&counter);
            async move {
                assert_eq!(props.routing_key, "monitoring.rule.config");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let body = serde_json::to_vec(&Ping { value: 1 }).unwrap();
        registry
            .dispatch(body, props("monitoring.rule.config"))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_patterns_preserves_registration_order() {
        let mut registry = HandlerRegistry::new();
        registry.on::<Ping, _, _>("a.b", |_p, _| async { Ok(()) });
        registry.on::<Ping, _, _>("c.#", |_p, _| async { Ok(()) });
        assert_eq!(registry.patterns(), vec!["a.b", "c.#"]);
    }
}
