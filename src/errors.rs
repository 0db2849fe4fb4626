//! Error taxonomy and standardized error responses
//!
//! Every failure in the platform surfaces as a [`ChimeraError`] carrying a
//! kind, a stable code string, a human-readable message, and a retryable
//! flag. Resilience primitives honor the flag; the agent core converts an
//! error escaping a handler into a nack (DLQ path) and an error message on
//! the chain's error routing key.

use serde::{Deserialize, Serialize};

use crate::domain_types::epoch_millis;

/// Broad classification of a failure, independent of the concrete code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// External data sources: broker down, HTTP 5xx, connection reset.
    DataSource,
    /// Malformed payloads, schema mismatches, validation failures.
    DataProcessing,
    /// Statistical or analytical computation failures.
    Analysis,
    /// Unparseable or unsupported natural-language input.
    Query,
    /// Upstream LLM API failures and rate limits.
    Llm,
    /// Fact-checking conflicts and verification failures.
    Verification,
    /// Infrastructure: database, cache, message bus.
    System,
    /// Caller mistakes: unauthorized, invalid input, quota exceeded.
    User,
}

/// Stable error codes shared with external callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Data source
    DataSourceUnavailable,
    DataSourceTimeout,
    DataSourceRateLimited,
    DataSourceInvalidResponse,

    // Data processing
    InsufficientData,
    InvalidDataFormat,
    DataValidationFailed,
    UnknownRoutingKey,

    // Analysis
    AnalysisFailed,
    AnomalyDetectionFailed,

    // Query
    InvalidQuery,
    QueryParsingFailed,
    AmbiguousQuery,

    // LLM
    LlmApiError,
    LlmRateLimited,
    LlmTimeout,

    // Verification
    VerificationFailed,
    ConflictDetected,

    // System
    InternalServerError,
    DatabaseError,
    CacheError,
    MessageBusError,
    ConfigurationError,

    // User
    Unauthorized,
    InvalidInput,
    QuotaExceeded,
}

impl ErrorCode {
    /// The stable string form used on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataSourceUnavailable => "DATA_SOURCE_UNAVAILABLE",
            Self::DataSourceTimeout => "DATA_SOURCE_TIMEOUT",
            Self::DataSourceRateLimited => "DATA_SOURCE_RATE_LIMITED",
            Self::DataSourceInvalidResponse => "DATA_SOURCE_INVALID_RESPONSE",
            Self::InsufficientData => "INSUFFICIENT_DATA",
            Self::InvalidDataFormat => "INVALID_DATA_FORMAT",
            Self::DataValidationFailed => "DATA_VALIDATION_FAILED",
            Self::UnknownRoutingKey => "UNKNOWN_ROUTING_KEY",
            Self::AnalysisFailed => "ANALYSIS_FAILED",
            Self::AnomalyDetectionFailed => "ANOMALY_DETECTION_FAILED",
            Self::InvalidQuery => "INVALID_QUERY",
            Self::QueryParsingFailed => "QUERY_PARSING_FAILED",
            Self::AmbiguousQuery => "AMBIGUOUS_QUERY",
            Self::LlmApiError => "LLM_API_ERROR",
            Self::LlmRateLimited => "LLM_RATE_LIMITED",
            Self::LlmTimeout => "LLM_TIMEOUT",
            Self::VerificationFailed => "VERIFICATION_FAILED",
            Self::ConflictDetected => "CONFLICT_DETECTED",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::CacheError => "CACHE_ERROR",
            Self::MessageBusError => "MESSAGE_BUS_ERROR",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidInput => "INVALID_INPUT",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The domain error type for all agent operations.
#[derive(Debug, Clone)]
pub struct ChimeraError {
    kind: ErrorKind,
    code: ErrorCode,
    message: String,
    retryable: bool,
    details: Option<serde_json::Value>,
    suggested_action: Option<String>,
}

impl ChimeraError {
    /// Creates an error with an explicit kind, code, and retryable flag.
    #[must_use]
    pub fn new(kind: ErrorKind, code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            retryable,
            details: None,
            suggested_action: None,
        }
    }

    /// A data-source failure (retryable by default). `source` names the
    /// upstream system and is recorded in the details.
    #[must_use]
    pub fn data_source(source: &str, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::DataSource,
            ErrorCode::DataSourceUnavailable,
            message,
            true,
        )
        .with_details(serde_json::json!({ "source": source }))
        .with_suggested_action("Check data source connectivity and try again")
    }

    /// A payload or schema failure (never retryable).
    #[must_use]
    pub fn data_processing(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::DataProcessing,
            ErrorCode::InvalidDataFormat,
            message,
            false,
        )
        .with_suggested_action("Verify data format and schema")
    }

    /// An analytical computation failure (never retryable).
    #[must_use]
    pub fn analysis(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Analysis, ErrorCode::AnalysisFailed, message, false)
            .with_suggested_action("Check data quality and analysis parameters")
    }

    /// A natural-language query failure (never retryable).
    #[must_use]
    pub fn query(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Query, ErrorCode::InvalidQuery, message, false)
            .with_suggested_action("Rephrase your query or provide more context")
    }

    /// An upstream LLM failure (retryable by default).
    #[must_use]
    pub fn llm(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Llm, ErrorCode::LlmApiError, message, true)
            .with_suggested_action("Wait a moment and try again")
    }

    /// A fact-checking failure (never retryable).
    #[must_use]
    pub fn verification(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Verification,
            ErrorCode::VerificationFailed,
            message,
            false,
        )
        .with_suggested_action("Review the conflicting data sources")
    }

    /// An infrastructure failure (retryable by default).
    #[must_use]
    pub fn system(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::System,
            ErrorCode::InternalServerError,
            message,
            true,
        )
        .with_suggested_action("Contact system administrator if problem persists")
    }

    /// A caller mistake (never retryable).
    #[must_use]
    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::User, ErrorCode::InvalidInput, message, false)
            .with_suggested_action("Check your input and try again")
    }

    /// A deadline violation. Timeouts are transient, so the error is
    /// retryable.
    #[must_use]
    pub fn timeout(limit: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::DataSource,
            ErrorCode::DataSourceTimeout,
            format!("operation timed out after {:.2}s", limit.as_secs_f64()),
            true,
        )
    }

    /// The fail-fast error emitted by an open circuit breaker. Retryable,
    /// so an outer retry may probe again after the recovery timeout.
    #[must_use]
    pub fn service_unavailable(breaker_name: &str) -> Self {
        Self::new(
            ErrorKind::DataSource,
            ErrorCode::DataSourceUnavailable,
            format!("circuit breaker '{breaker_name}' is open"),
            true,
        )
        .with_details(serde_json::json!({ "circuit_breaker": breaker_name }))
    }

    /// Overrides the code.
    #[must_use]
    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = code;
        self
    }

    /// Overrides the retryable flag.
    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attaches structured details. Merges with any details already set.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = match self.details.take() {
            Some(serde_json::Value::Object(mut existing)) => {
                if let serde_json::Value::Object(new) = details {
                    existing.extend(new);
                    Some(serde_json::Value::Object(existing))
                } else {
                    Some(serde_json::Value::Object(existing))
                }
            }
            _ => Some(details),
        };
        self
    }

    /// Attaches a suggested remediation for the caller.
    #[must_use]
    pub fn with_suggested_action(mut self, action: impl Into<String>) -> Self {
        self.suggested_action = Some(action.into());
        self
    }

    /// The error's broad classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The stable code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether a retry of the failed operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Structured details, when present.
    #[must_use]
    pub fn details(&self) -> Option<&serde_json::Value> {
        self.details.as_ref()
    }

    /// Converts the error into the wire-format body.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code.as_str().to_string(),
            message: self.message.clone(),
            retryable: self.retryable,
            details: self.details.clone(),
            suggested_action: self.suggested_action.clone(),
        }
    }
}

impl std::fmt::Display for ChimeraError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ChimeraError {}

impl From<lapin::Error> for ChimeraError {
    fn from(err: lapin::Error) -> Self {
        Self::new(
            ErrorKind::System,
            ErrorCode::MessageBusError,
            format!("message bus error: {err}"),
            true,
        )
    }
}

impl From<redis::RedisError> for ChimeraError {
    fn from(err: redis::RedisError) -> Self {
        Self::new(
            ErrorKind::System,
            ErrorCode::CacheError,
            format!("cache error: {err}"),
            true,
        )
    }
}

impl From<serde_json::Error> for ChimeraError {
    fn from(err: serde_json::Error) -> Self {
        Self::data_processing(format!("serialization error: {err}"))
    }
}

impl From<reqwest::Error> for ChimeraError {
    fn from(err: reqwest::Error) -> Self {
        let retryable = err.is_timeout() || err.is_connect() || err.status().is_none_or(|s| s.is_server_error());
        Self::new(
            ErrorKind::DataSource,
            ErrorCode::DataSourceUnavailable,
            format!("http error: {err}"),
            retryable,
        )
    }
}

/// Wire-format error payload inside [`ErrorResponse`] and on-bus error
/// messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    /// Stable code string.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Whether the caller may retry.
    pub retryable: bool,
    /// Optional structured context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Optional remediation hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

/// The only error shape external callers receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// The error body.
    pub error: ErrorBody,
    /// The correlation/request id of the failed chain, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Milliseconds since epoch.
    pub timestamp: i64,
}

impl ErrorResponse {
    /// Builds a standardized response from a domain error.
    #[must_use]
    pub fn from_error(error: &ChimeraError, request_id: Option<String>) -> Self {
        Self {
            error: error.to_body(),
            request_id,
            timestamp: epoch_millis(),
        }
    }
}
