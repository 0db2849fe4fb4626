//! Test doubles for the messaging layer
//!
//! The in-memory publisher lets the full agent core run without a broker:
//! tests assert on the exact messages an agent would have published.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain_types::AgentName;
use crate::errors::ChimeraError;
use crate::messaging::publisher::{MessagePublisher, PublishOptions};

/// One recorded publish.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub options: PublishOptions,
}

/// Publisher that records messages instead of sending them.
pub struct MemoryPublisher {
    agent_name: AgentName,
    published: Mutex<Vec<PublishedMessage>>,
    fail_next: Mutex<bool>,
}

impl MemoryPublisher {
    /// Creates a recorder publishing as the given agent.
    ///
    /// # Panics
    /// Panics when `agent_name` is not a valid agent name.
    #[must_use]
    pub fn new(agent_name: &str) -> Self {
        Self {
            agent_name: AgentName::try_new(agent_name).expect("valid test agent name"),
            published: Mutex::new(Vec::new()),
            fail_next: Mutex::new(false),
        }
    }

    /// All messages recorded so far.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    /// Messages recorded under one routing key.
    #[must_use]
    pub fn published_on(&self, routing_key: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|message| message.routing_key == routing_key)
            .collect()
    }

    /// Makes the next publish fail with a bus error.
    pub fn fail_next_publish(&self) {
        if let Ok(mut flag) = self.fail_next.lock() {
            *flag = true;
        }
    }

    /// Drops all recorded messages.
    pub fn clear(&self) {
        if let Ok(mut messages) = self.published.lock() {
            messages.clear();
        }
    }
}

#[async_trait]
impl MessagePublisher for MemoryPublisher {
    async fn publish_raw(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), ChimeraError> {
        if let Ok(mut flag) = self.fail_next.lock() {
            if *flag {
                *flag = false;
                return Err(ChimeraError::system("simulated publish failure"));
            }
        }
        if let Ok(mut messages) = self.published.lock() {
            messages.push(PublishedMessage {
                routing_key: routing_key.to_string(),
                body,
                options,
            });
        }
        Ok(())
    }

    fn agent_name(&self) -> &AgentName {
        &self.agent_name
    }
}
