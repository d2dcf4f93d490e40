use std::env;
use std::time::Duration;

use opentelemetry::global;
use opentelemetry::trace::{TraceContextExt, TracerProvider as _};
use opentelemetry::KeyValue;
use opentelemetry_http::HeaderExtractor;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{Config, Sampler, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::SERVICE_NAME;

/// Flushes and shuts the tracer provider down when dropped.
pub struct TracerGuard;

impl Drop for TracerGuard {
    fn drop(&mut self) {
        tracing::info!("shutting down tracer");
        global::shutdown_tracer_provider();
    }
}

/// Where spans go, picked by `OTEL_EXPORTER_OTLP_ENDPOINT`.
#[derive(Debug, PartialEq)]
enum Exporter {
    None,
    Stdout,
    Otlp(String),
}

impl Exporter {
    fn from_endpoint(endpoint: Option<&str>) -> Self {
        match endpoint.map(str::trim) {
            None | Some("") => Exporter::None,
            Some("stdout") => Exporter::Stdout,
            Some(url) => Exporter::Otlp(url.to_string()),
        }
    }
}

fn sampling_rate() -> f64 {
    env::var("OTEL_SAMPLING_RATE")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|r: &f64| (0.0..=1.0).contains(r))
        .unwrap_or(1.0)
}

fn build_provider(exporter: &Exporter) -> anyhow::Result<TracerProvider> {
    let service_name = env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| SERVICE_NAME.to_string());
    let provider = match exporter {
        Exporter::None => TracerProvider::builder()
            .with_config(Config::default())
            .build(),
        Exporter::Stdout => TracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build(),
        Exporter::Otlp(endpoint) => opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .http()
                    .with_endpoint(endpoint)
                    .with_timeout(Duration::from_secs(5)),
            )
            .with_trace_config(
                Config::default()
                    .with_sampler(Sampler::TraceIdRatioBased(sampling_rate()))
                    .with_resource(Resource::new(vec![KeyValue::new(
                        "service.name",
                        service_name,
                    )])),
            )
            .install_batch(runtime::Tokio)?,
    };
    Ok(provider)
}

/// Installs the tracing subscriber (env filter, compact fmt, OpenTelemetry)
/// and the global tracer provider. Keep the guard alive until exit.
pub fn init_tracing() -> anyhow::Result<TracerGuard> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
    let exporter = Exporter::from_endpoint(endpoint.as_deref());
    let provider = build_provider(&exporter)?;
    global::set_tracer_provider(provider.clone());

    let telemetry = tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME));
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::Layer::default().compact())
        .with(telemetry)
        .init();
    tracing::info!(exporter = ?exporter, "tracer");
    Ok(TracerGuard)
}

/// Span for one incoming call, parented to the caller's `traceparent`.
pub fn request_span(headers: &http::HeaderMap, method: &'static str) -> tracing::Span {
    let cx = global::get_text_map_propagator(|p| p.extract(&HeaderExtractor(headers)));
    let trace_id = cx.span().span_context().trace_id().to_string();
    let span = tracing::info_span!("request", otel.kind = "server", method, trace_id);
    span.set_parent(cx);
    span
}
