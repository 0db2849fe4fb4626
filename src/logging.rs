//! Structured JSON logging with ambient correlation IDs
//!
//! Log output is newline-delimited JSON on stdout. A correlation ID bound
//! with [`with_correlation_id`] rides along on every record emitted inside
//! the scope, carried both by a task-local (for error envelopes) and by a
//! span field (for log records), so concurrent flows never
//! cross-contaminate.

use std::future::Future;

use tracing::Instrument;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::ChimeraConfig;
use crate::domain_types::CorrelationId;
use crate::errors::ChimeraError;
use crate::telemetry;

tokio::task_local! {
    static CORRELATION_ID: Option<String>;
}

/// Runs a future with the given correlation ID bound as the ambient value
/// and recorded on a wrapping span, so every log record emitted inside the
/// scope carries it.
pub async fn with_correlation_id<F>(correlation_id: &CorrelationId, fut: F) -> F::Output
where
    F: Future,
{
    let span = tracing::info_span!("correlated", correlation_id = %correlation_id);
    CORRELATION_ID
        .scope(Some(correlation_id.as_str().to_string()), fut.instrument(span))
        .await
}

/// The correlation ID bound to the current task, if any.
#[must_use]
pub fn current_correlation_id() -> Option<String> {
    CORRELATION_ID.try_with(Clone::clone).unwrap_or(None)
}

/// Initializes JSON logging and, when a trace endpoint is configured, OTLP
/// span export. Must be called once per process before any agent starts.
///
/// # Errors
/// Returns an error when a subscriber is already installed or the tracer
/// pipeline cannot be built.
pub fn init_observability(service: &str, config: &ChimeraConfig) -> Result<(), ChimeraError> {
    telemetry::init_propagator();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter_str()));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true);

    match &config.trace_endpoint {
        Some(endpoint) => {
            let tracer = telemetry::init_tracer(service, endpoint)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|e| ChimeraError::system(format!("failed to init logging: {e}")))?;
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
                .map_err(|e| ChimeraError::system(format!("failed to init logging: {e}")))?;
        }
    }

    tracing::info!(service, environment = ?config.environment, "observability initialized");
    Ok(())
}
