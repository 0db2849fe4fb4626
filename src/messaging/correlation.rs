//! In-process correlation tracking for request/response flows
//!
//! A correlation entry is created only by a request-style publish and
//! removed on a matching response, an explicit clear, or a TTL reap.
//! Reaping is an explicit operation called by the agent on its own
//! cadence, keeping tests deterministic. Absence of an entry for a
//! response is tolerated: responses arriving after a restart are handled
//! by best-effort logic.

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::domain_types::{epoch_millis, CorrelationId};

/// Per-request context stored while a reply is outstanding.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationEntry {
    /// Routing key the request went out on.
    pub request_routing_key: String,
    /// Routing key the reply is expected on.
    pub reply_routing_key: String,
    /// Free-form caller context, returned verbatim on lookup.
    pub context: HashMap<String, String>,
    /// Milliseconds since epoch at creation.
    pub created_at_ms: i64,
}

/// Thread-safe map of outstanding correlation IDs. Purely local to the
/// process; never shared across agents.
#[derive(Default)]
pub struct CorrelationRegistry {
    entries: DashMap<CorrelationId, CorrelationEntry>,
}

impl CorrelationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new entry stamped with the current time.
    pub fn store(
        &self,
        correlation_id: &CorrelationId,
        request_routing_key: &str,
        reply_routing_key: &str,
        context: HashMap<String, String>,
    ) {
        self.insert(
            correlation_id,
            CorrelationEntry {
                request_routing_key: request_routing_key.to_string(),
                reply_routing_key: reply_routing_key.to_string(),
                context,
                created_at_ms: epoch_millis(),
            },
        );
    }

    /// Stores an entry with an explicit creation timestamp.
    pub fn insert(&self, correlation_id: &CorrelationId, entry: CorrelationEntry) {
        self.entries.insert(correlation_id.clone(), entry);
    }

    /// Looks up the context stored for a correlation ID.
    #[must_use]
    pub fn get(&self, correlation_id: &CorrelationId) -> Option<CorrelationEntry> {
        self.entries.get(correlation_id).map(|entry| entry.clone())
    }

    /// Removes an entry. Returns whether one existed.
    pub fn clear(&self, correlation_id: &CorrelationId) -> bool {
        let removed = self.entries.remove(correlation_id).is_some();
        if removed {
            debug!(correlation_id = %correlation_id, "cleared correlation entry");
        }
        removed
    }

    /// Removes every entry older than `max_age` and returns the count
    /// removed. Idempotent: a second call with the same age removes
    /// nothing new.
    pub fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let cutoff_ms = epoch_millis() - i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let stale: Vec<CorrelationId> = self
            .entries
            .iter()
            .filter(|entry| entry.value().created_at_ms < cutoff_ms)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for correlation_id in stale {
            if self.entries.remove(&correlation_id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "cleaned up old correlation entries");
        }
        removed
    }

    /// Number of outstanding entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
