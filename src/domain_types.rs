//! Strongly-typed domain values shared across the platform
//!
//! These newtypes prevent primitive obsession in the messaging core: agent
//! names, correlation identifiers, and bounded configuration values all get
//! their own validated types.

use nutype::nutype;
use uuid::Uuid;

/// Unique name of an agent process. Doubles as the queue name for the
/// agent's subscription.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        AsRef,
        TryFrom,
        Into
    )
)]
pub struct AgentName(String);

/// Opaque identifier shared by every message in one logical
/// request/response chain.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRef,
    From,
    Into
))]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Creates a fresh random correlation ID.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    /// Borrows the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Unique identifier for a single message (one per hop).
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRef,
    From,
    Into
))]
pub struct MessageId(String);

impl MessageId {
    /// Creates a fresh random message ID.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}

/// Maximum number of un-acked deliveries the broker may hand a consumer
/// channel. Also the handler concurrency level of an agent.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1
)]
pub struct PrefetchCount(u16);

impl PrefetchCount {
    /// Gets the value as u16 for channel QoS.
    #[must_use]
    pub fn as_u16(&self) -> u16 {
        self.into_inner()
    }
}

/// Queue-level message TTL in milliseconds before expiry to the DLQ.
#[nutype(
    validate(less_or_equal = 604_800_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 86_400_000
)]
pub struct MessageTtlMs(u64);

impl MessageTtlMs {
    /// Gets the value as u64 milliseconds.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Returns the current wall-clock time as milliseconds since the Unix
/// epoch, the timestamp unit used in message metadata.
#[must_use]
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
