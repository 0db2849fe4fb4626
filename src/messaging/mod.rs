//! The agent runtime and messaging fabric
//!
//! Everything that ties the agents together: the broker connection and
//! channel lifecycle, publish/subscribe with dead-letter handling, the
//! routing-key dispatch table, correlation-tracked request/response
//! flows, and the typed payload schemas.
//!
//! ```text
//! delivery -> EventSubscriber -> AgentCore.handle_delivery
//!                                   |  span + ambient correlation id
//!                                   v
//!                             HandlerRegistry -> agent handler
//!                                   |                |
//!                                  ack            publish via AgentCore
//! ```

pub mod agent;
pub mod channel;
pub mod connection;
pub mod correlation;
pub mod envelope;
pub mod payloads;
pub mod publisher;
pub mod registry;
pub mod subscriber;
pub mod test_utils;

/// Default durable topic exchange shared by all agents.
pub const DEFAULT_EXCHANGE: &str = "chimera.events";

pub use agent::{error_routing_key, AgentCore, AgentRuntime};
pub use channel::ChannelManager;
pub use connection::ConnectionManager;
pub use correlation::{CorrelationEntry, CorrelationRegistry};
pub use envelope::{MessageMetadata, CONTENT_TYPE_JSON};
pub use publisher::{EventPublisher, MessagePublisher, PublishOptions};
pub use registry::{routing_key_matches, DeliveryProps, HandlerRegistry};
pub use subscriber::{ack_decision, AckDecision, EventSubscriber, ShutdownHandle};
