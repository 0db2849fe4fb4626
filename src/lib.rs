//! # Chimera - Distributed Multi-Agent Analytics Platform
//!
//! Chimera answers natural-language questions about blockchain markets by
//! fanning each question across specialized agents (query parsing, data
//! retrieval, analysis, narrative, fact checking, follow-up, monitoring)
//! over a shared topic-routed message bus.
//!
//! ## Architecture
//!
//! The platform's core is the agent runtime and messaging fabric in
//! [`messaging`]: one broker connection per process, named channels,
//! durable topic exchanges with per-agent queues and dead-letter
//! handling, a routing-key dispatch table per agent, and
//! correlation-tracked request/response flows.
//!
//! ```text
//! query.request -> query -> data_retrieval.request -> data_retrieval
//!                     ^                                      |
//!                     |                          data_retrieval.response
//!              analysis.result <- analysis <------------------+
//!                     |
//!                     +-> narrative -> fact_checker
//!                     +-> query.response / followup.request
//! ```
//!
//! Cross-cutting concerns live beside the fabric: [`resilience`] (retry,
//! circuit breaker, fallback, timeout), [`logging`] and [`telemetry`]
//! (JSON logs with ambient correlation IDs, W3C trace context across
//! hops), [`session`] (per-session conversation context in the KV
//! store), and [`monitoring`] (alert rules, scheduling, notifications).
//!
//! ## Delivery semantics
//!
//! End-to-end delivery is at-least-once: handler success acks, any
//! failure nacks without requeue so the broker dead-letters the message
//! into the agent's DLQ. Handlers are expected to be idempotent or to
//! dedup on correlation/message IDs.

pub mod agents;
pub mod config;
pub mod domain_types;
pub mod errors;
pub mod logging;
pub mod messaging;
pub mod monitoring;
pub mod resilience;
pub mod session;
pub mod storage;
pub mod telemetry;

pub use config::{ChimeraConfig, ConfigError};
pub use domain_types::{AgentName, CorrelationId, MessageId, PrefetchCount};
pub use errors::{ChimeraError, ErrorCode, ErrorKind, ErrorResponse};
pub use messaging::{AgentCore, AgentRuntime, HandlerRegistry};
