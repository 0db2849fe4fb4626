//! Message envelope metadata and payload serialization
//!
//! Every payload on the bus embeds a [`MessageMetadata`] sub-record. The
//! [`serialize`] / [`deserialize`] helpers are the only points where
//! payload-schema knowledge enters the messaging core.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain_types::{epoch_millis, AgentName, CorrelationId, MessageId};
use crate::errors::ChimeraError;

/// Content type marker identifying the payload schema on the wire.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// The metadata sub-record carried by every payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Unique per message (one hop).
    pub message_id: MessageId,
    /// Shared by all messages in one logical request chain.
    pub correlation_id: CorrelationId,
    /// Milliseconds since epoch at creation.
    pub timestamp_ms: i64,
    /// Name of the publishing agent.
    pub sender_agent: String,
    /// Routing key the sender expects a reply on, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl MessageMetadata {
    /// Builds envelope metadata for an outgoing message. A fresh
    /// correlation ID is generated when none is supplied.
    #[must_use]
    pub fn new(
        sender: &AgentName,
        correlation_id: Option<CorrelationId>,
        reply_to: Option<String>,
    ) -> Self {
        Self {
            message_id: MessageId::generate(),
            correlation_id: correlation_id.unwrap_or_else(CorrelationId::generate),
            timestamp_ms: epoch_millis(),
            sender_agent: sender.as_ref().to_string(),
            reply_to,
        }
    }

    /// Builds response metadata reusing the caller's correlation ID.
    #[must_use]
    pub fn response(sender: &AgentName, correlation_id: CorrelationId) -> Self {
        Self::new(sender, Some(correlation_id), None)
    }
}

/// Serializes a payload for publishing.
///
/// # Errors
/// Returns a data-processing error when the payload cannot be encoded.
pub fn serialize<P: Serialize>(payload: &P) -> Result<Vec<u8>, ChimeraError> {
    Ok(serde_json::to_vec(payload)?)
}

/// Deserializes an incoming payload body.
///
/// # Errors
/// Returns a data-processing error when the body does not match the
/// expected schema.
pub fn deserialize<P: DeserializeOwned>(body: &[u8]) -> Result<P, ChimeraError> {
    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sender() -> AgentName {
        AgentName::try_new("query").unwrap()
    }

    #[test]
    fn test_metadata_generates_ids() {
        let metadata = MessageMetadata::new(&sender(), None, None);
        assert_eq!(metadata.sender_agent, "query");
        assert!(metadata.timestamp_ms > 0);
        assert!(metadata.reply_to.is_none());

        let other = MessageMetadata::new(&sender(), None, None);
        assert_ne!(metadata.message_id, other.message_id);
        assert_ne!(metadata.correlation_id, other.correlation_id);
    }

    #[test]
    fn test_response_reuses_correlation_id() {
        let correlation_id = CorrelationId::generate();
        let metadata = MessageMetadata::response(&sender(), correlation_id.clone());
        assert_eq!(metadata.correlation_id, correlation_id);
    }

    #[test]
    fn test_metadata_round_trip() {
        let metadata = MessageMetadata::new(&sender(), None, Some("test.response".to_string()));
        let bytes = serialize(&metadata).unwrap();
        let decoded: MessageMetadata = deserialize(&bytes).unwrap();
        assert_eq!(metadata, decoded);
    }

    #[test]
    fn test_deserialize_rejects_schema_mismatch() {
        let err = deserialize::<MessageMetadata>(b"{\"not\":\"metadata\"}").unwrap_err();
        assert!(!err.is_retryable());
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        metadata: MessageMetadata,
        query: String,
        values: Vec<f64>,
        tags: std::collections::BTreeMap<String, String>,
    }

    proptest! {
        #[test]
        fn prop_serialize_deserialize_round_trips(
            query in ".*",
            values in proptest::collection::vec(-1.0e12f64..1.0e12, 0..8),
            tags in proptest::collection::btree_map("[a-z]{1,8}", "[a-z0-9]{0,12}", 0..4),
        ) {
            let sample = Sample {
                metadata: MessageMetadata::new(&sender(), None, None),
                query,
                values,
                tags,
            };
            let bytes = serialize(&sample).unwrap();
            let decoded: Sample = deserialize(&bytes).unwrap();
            prop_assert_eq!(sample, decoded);
        }
    }
}
