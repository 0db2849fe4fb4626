//! Distributed tracing over message hops
//!
//! Trace context crosses the bus in message headers using the W3C
//! tracecontext format (`traceparent`, optional `tracestate`). Publishers
//! inject the active span's context; subscribers extract it and parent the
//! handler span on the sender's span, linking one request's work end to
//! end. Span export goes to an OTLP collector when configured.

use std::collections::BTreeMap;

use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry::{global, Context, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_sdk::Resource;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::errors::ChimeraError;

/// Installs the W3C tracecontext propagator. Idempotent; called by
/// observability init before any agent starts.
pub fn init_propagator() {
    global::set_text_map_propagator(TraceContextPropagator::new());
}

/// Builds the OTLP span export pipeline for this service.
///
/// # Errors
/// Returns an error when the exporter cannot be constructed.
pub fn init_tracer(service: &str, endpoint: &str) -> Result<sdktrace::Tracer, ChimeraError> {
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint.to_string()),
        )
        .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service.to_string()),
        ])))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .map_err(|e| ChimeraError::system(format!("failed to install tracer: {e}")))?;
    Ok(tracer)
}

/// Flushes and shuts down the global tracer provider. Called on process
/// exit so buffered spans are not lost.
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

struct HeaderInjector<'a>(&'a mut BTreeMap<String, String>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

struct HeaderExtractor<'a>(&'a BTreeMap<String, String>);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Injects the current span's context into outgoing message headers.
pub fn inject_trace_context(headers: &mut BTreeMap<String, String>) {
    let cx = tracing::Span::current().context();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut HeaderInjector(headers));
    });
}

/// Extracts a remote trace context from incoming message headers.
#[must_use]
pub fn extract_trace_context(headers: &BTreeMap<String, String>) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}

/// Creates the span wrapping one message-handler invocation, parented on
/// the sender's span when the headers carry a trace context.
#[must_use]
pub fn handler_span(
    agent_name: &str,
    routing_key: &str,
    correlation_id: Option<&str>,
    headers: &BTreeMap<String, String>,
) -> tracing::Span {
    let span = tracing::info_span!(
        "handle_message",
        agent.name = agent_name,
        message.routing_key = routing_key,
        message.correlation_id = correlation_id.unwrap_or(""),
    );
    if headers.contains_key("traceparent") {
        span.set_parent(extract_trace_context(headers));
    }
    span
}
