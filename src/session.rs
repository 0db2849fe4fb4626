//! Per-session conversation context with sliding TTL
//!
//! Session context lives in the external key-value store under
//! `chimera:context:<session-id>` as a JSON object. Every read or write
//! slides the TTL. History keeps the last ten queries; context extraction
//! looks at the last three.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain_types::epoch_millis;
use crate::errors::ChimeraError;
use crate::messaging::payloads::{Entity, EntityType, QueryIntent, TimeRange};
use crate::storage::KeyValueStore;

/// Default sliding TTL for session context.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

const KEY_PREFIX: &str = "chimera:context:";
const MAX_HISTORY: usize = 10;
const MERGE_WINDOW: usize = 3;

/// One query in a session's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub query: String,
    pub timestamp_ms: i64,
    pub intent: QueryIntent,
    pub entities: Vec<Entity>,
}

/// The stored per-session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    pub created_at_ms: i64,
    pub last_updated_ms: i64,
    pub query_history: Vec<QueryRecord>,
}

impl SessionContext {
    fn new(session_id: &str) -> Self {
        let now = epoch_millis();
        Self {
            session_id: session_id.to_string(),
            created_at_ms: now,
            last_updated_ms: now,
            query_history: Vec::new(),
        }
    }
}

/// Context distilled from recent history for interpreting the next query.
#[derive(Debug, Clone, Default)]
pub struct ExtractedContext {
    /// The immediately preceding query, for reference resolution.
    pub last_query: Option<QueryRecord>,
    /// Entities appearing more than once in the last three queries.
    pub recent_entities: Vec<Entity>,
    /// The most recent explicit time range in history.
    pub time_range: Option<TimeRange>,
    /// Deduplicated metrics from recent history, most recent first.
    pub metrics: Vec<String>,
    /// Total queries in this session.
    pub query_count: usize,
}

/// Store of per-session conversation context.
pub struct SessionContextStore {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl SessionContextStore {
    /// Creates a store with an explicit TTL.
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Creates a store with the default one-hour sliding TTL.
    #[must_use]
    pub fn with_default_ttl(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::new(kv, DEFAULT_SESSION_TTL)
    }

    fn key(session_id: &str) -> String {
        format!("{KEY_PREFIX}{session_id}")
    }

    /// Fetches a session's context, sliding its TTL.
    ///
    /// # Errors
    /// Propagates store failures; a missing session is `None`.
    pub async fn get(&self, session_id: &str) -> Result<Option<SessionContext>, ChimeraError> {
        let key = Self::key(session_id);
        match self.kv.get(&key).await? {
            None => Ok(None),
            Some(raw) => {
                let context: SessionContext = serde_json::from_str(&raw)?;
                self.kv.expire(&key, self.ttl).await?;
                Ok(Some(context))
            }
        }
    }

    /// Saves a session's context with a fresh TTL, stamping
    /// `last_updated`. Returns the stamped context.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn save(&self, mut context: SessionContext) -> Result<SessionContext, ChimeraError> {
        context.last_updated_ms = epoch_millis();
        let raw = serde_json::to_string(&context)?;
        self.kv
            .set_with_ttl(&Self::key(&context.session_id), &raw, self.ttl)
            .await?;
        debug!(session_id = %context.session_id, "saved session context");
        Ok(context)
    }

    /// Applies a mutation to a session's context (creating it when
    /// absent) and saves the result.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn update<F>(&self, session_id: &str, mutate: F) -> Result<SessionContext, ChimeraError>
    where
        F: FnOnce(&mut SessionContext) + Send,
    {
        let mut context = self
            .get(session_id)
            .await?
            .unwrap_or_else(|| SessionContext::new(session_id));
        mutate(&mut context);
        self.save(context).await
    }

    /// Appends a query to the session history, retaining only the last
    /// ten entries.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn append_query(
        &self,
        session_id: &str,
        query: &str,
        intent: QueryIntent,
        entities: Vec<Entity>,
    ) -> Result<SessionContext, ChimeraError> {
        let record = QueryRecord {
            query: query.to_string(),
            timestamp_ms: epoch_millis(),
            intent,
            entities,
        };
        self.update(session_id, |context| {
            context.query_history.push(record);
            let overflow = context.query_history.len().saturating_sub(MAX_HISTORY);
            if overflow > 0 {
                context.query_history.drain(..overflow);
            }
        })
        .await
    }

    /// Distills recent history into context for the current query.
    ///
    /// # Errors
    /// Propagates store failures; an unknown session yields empty
    /// context.
    pub async fn extract_for_query(
        &self,
        session_id: &str,
        _current_query: &str,
    ) -> Result<ExtractedContext, ChimeraError> {
        let Some(context) = self.get(session_id).await? else {
            return Ok(ExtractedContext::default());
        };
        let history = &context.query_history;
        let window_start = history.len().saturating_sub(MERGE_WINDOW);
        let window = &history[window_start..];

        Ok(ExtractedContext {
            last_query: history.last().cloned(),
            recent_entities: recurring_entities(window),
            time_range: latest_time_range(window),
            metrics: recent_metrics(window),
            query_count: history.len(),
        })
    }

    /// Removes a session's context.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn clear(&self, session_id: &str) -> Result<(), ChimeraError> {
        self.kv.delete(&Self::key(session_id)).await
    }

    /// Slides the TTL without touching the value. Returns false when the
    /// session does not exist.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn extend_ttl(&self, session_id: &str) -> Result<bool, ChimeraError> {
        self.kv.expire(&Self::key(session_id), self.ttl).await
    }
}

/// Entities appearing more than once across the window, keyed by type
/// and value.
fn recurring_entities(window: &[QueryRecord]) -> Vec<Entity> {
    let mut counts: std::collections::HashMap<(EntityType, String), (usize, Entity)> =
        std::collections::HashMap::new();
    for record in window {
        for entity in &record.entities {
            let key = (entity.entity_type, entity.value.clone());
            let slot = counts.entry(key).or_insert_with(|| (0, entity.clone()));
            slot.0 += 1;
            slot.1 = entity.clone();
        }
    }
    let mut recurring: Vec<(usize, Entity)> = counts
        .into_values()
        .filter(|(count, _)| *count > 1)
        .collect();
    recurring.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.value.cmp(&b.1.value)));
    recurring.into_iter().map(|(_, entity)| entity).collect()
}

/// The most recent explicit time range in the window.
fn latest_time_range(window: &[QueryRecord]) -> Option<TimeRange> {
    window
        .iter()
        .rev()
        .find_map(|record| record.intent.time_range)
}

/// Deduplicated metrics across the window, most recent first.
fn recent_metrics(window: &[QueryRecord]) -> Vec<String> {
    let mut metrics = Vec::new();
    for record in window.iter().rev() {
        for metric in &record.intent.metrics {
            if !metrics.contains(metric) {
                metrics.push(metric.clone());
            }
        }
    }
    metrics
}

/// Merges extracted context into the current query's entities. Entities
/// already present on the current query are never overwritten; context
/// only fills gaps.
#[must_use]
pub fn merge_context_entities(current: &[Entity], context: &ExtractedContext) -> Vec<Entity> {
    let mut merged = current.to_vec();

    let has_time = current
        .iter()
        .any(|e| matches!(e.entity_type, EntityType::TimeRange | EntityType::Date));
    if !has_time {
        if let Some(range) = &context.time_range {
            merged.push(Entity::from_context(
                EntityType::TimeRange,
                format!("{}..{}", range.start_ms, range.end_ms),
                0.7,
            ));
        }
    }

    let has_metric = current.iter().any(|e| e.entity_type == EntityType::Metric);
    if !has_metric {
        for metric in &context.metrics {
            merged.push(Entity::from_context(EntityType::Metric, metric.clone(), 0.6));
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::payloads::IntentType;
    use crate::storage::MemoryStore;

    fn store() -> SessionContextStore {
        SessionContextStore::with_default_ttl(Arc::new(MemoryStore::new()))
    }

    fn intent(metrics: &[&str], time_range: Option<TimeRange>) -> QueryIntent {
        QueryIntent {
            intent_type: IntentType::General,
            metrics: metrics.iter().map(|m| (*m).to_string()).collect(),
            time_range,
        }
    }

    fn asset(symbol: &str) -> Entity {
        Entity::from_query(EntityType::Asset, symbol, 0.9)
    }

    #[tokio::test]
    async fn test_get_missing_session_is_none() {
        assert!(store().get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_query_caps_history_at_ten() {
        let store = store();
        for i in 0..13 {
            store
                .append_query("s1", &format!("query {i}"), intent(&[], None), vec![])
                .await
                .unwrap();
        }
        let context = store.get("s1").await.unwrap().unwrap();
        assert_eq!(context.query_history.len(), 10);
        assert_eq!(context.query_history[0].query, "query 3");
        assert_eq!(context.query_history[9].query, "query 12");
    }

    #[tokio::test]
    async fn test_extract_recurring_entities_from_last_three() {
        let store = store();
        // ZEC appears in all three recent queries, BTC only once
        store
            .append_query("s1", "zec price", intent(&["price"], None), vec![asset("ZEC")])
            .await
            .unwrap();
        store
            .append_query("s1", "zec volume", intent(&["volume"], None), vec![asset("ZEC")])
            .await
            .unwrap();
        store
            .append_query(
                "s1",
                "compare btc",
                intent(&["price"], None),
                vec![asset("ZEC"), asset("BTC")],
            )
            .await
            .unwrap();

        let extracted = store.extract_for_query("s1", "and now?").await.unwrap();
        assert_eq!(extracted.query_count, 3);
        assert_eq!(extracted.recent_entities.len(), 1);
        assert_eq!(extracted.recent_entities[0].value, "ZEC");
        assert_eq!(extracted.last_query.unwrap().query, "compare btc");
        // Most recent first, deduplicated
        assert_eq!(extracted.metrics, vec!["price", "volume"]);
    }

    #[tokio::test]
    async fn test_extract_time_range_prefers_most_recent() {
        let store = store();
        let old_range = TimeRange { start_ms: 0, end_ms: 100 };
        let new_range = TimeRange { start_ms: 200, end_ms: 300 };
        store
            .append_query("s1", "a", intent(&[], Some(old_range)), vec![])
            .await
            .unwrap();
        store
            .append_query("s1", "b", intent(&[], Some(new_range)), vec![])
            .await
            .unwrap();
        store
            .append_query("s1", "c", intent(&[], None), vec![])
            .await
            .unwrap();

        let extracted = store.extract_for_query("s1", "d").await.unwrap();
        assert_eq!(extracted.time_range, Some(new_range));
    }

    #[tokio::test]
    async fn test_merge_fills_gaps_without_overwriting() {
        let context = ExtractedContext {
            time_range: Some(TimeRange { start_ms: 1, end_ms: 2 }),
            metrics: vec!["volume".to_string()],
            ..ExtractedContext::default()
        };

        // Current query already names a metric: context metrics must not
        // be added, but the missing time range is filled in
        let current = vec![
            asset("ZEC"),
            Entity::from_query(EntityType::Metric, "price", 0.95),
        ];
        let merged = merge_context_entities(&current, &context);
        assert_eq!(merged.len(), 3);
        assert!(merged.iter().any(|e| e.entity_type == EntityType::TimeRange));
        let metrics: Vec<&str> = merged
            .iter()
            .filter(|e| e.entity_type == EntityType::Metric)
            .map(|e| e.value.as_str())
            .collect();
        assert_eq!(metrics, vec!["price"]);
    }

    #[tokio::test]
    async fn test_merge_adds_context_metrics_when_absent() {
        let context = ExtractedContext {
            metrics: vec!["volume".to_string(), "price".to_string()],
            ..ExtractedContext::default()
        };
        let merged = merge_context_entities(&[asset("ZEC")], &context);
        let from_context: Vec<&Entity> = merged
            .iter()
            .filter(|e| e.source.as_deref() == Some("context"))
            .collect();
        assert_eq!(from_context.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_ttl_on_reads() {
        let store = SessionContextStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        store
            .append_query("s1", "q", intent(&[], None), vec![])
            .await
            .unwrap();

        // Keep reading just inside the TTL; the session must survive
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(45)).await;
            assert!(store.get("s1").await.unwrap().is_some());
        }

        // Stop touching it and it expires
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_removes_session() {
        let store = store();
        store
            .append_query("s1", "q", intent(&[], None), vec![])
            .await
            .unwrap();
        store.clear("s1").await.unwrap();
        assert!(store.get("s1").await.unwrap().is_none());
        assert!(!store.extend_ttl("s1").await.unwrap());
    }
}
