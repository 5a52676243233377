//! Logging and tracing initialization.
//!
//! Provides `init_telemetry()` for tracing setup and `shutdown_telemetry()` for cleanup.
//! When `OTEL_EXPORTER_OTLP_ENDPOINT` is set, spans are exported via OTLP.
//! Otherwise, only log output is enabled.

use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::sync::OnceLock;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Initialize logging with optional OTLP export.
///
/// # Environment Variables
/// - `RUST_LOG`: full filter directives (takes precedence)
/// - `LOG_LEVEL`: plain level used when `RUST_LOG` is unset (default: "info")
/// - `LOG_FORMAT`: `json` for one JSON object per line, anything else for text
///
/// Logs go to stderr; stdout is reserved for run outcomes.
/// - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint URL (enables export when set)
/// - `OTEL_SERVICE_NAME`: service name reported by the exporter
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    let env_filter = build_filter(
        std::env::var("RUST_LOG").ok().as_deref(),
        std::env::var("LOG_LEVEL").ok().as_deref(),
    );

    let fmt_layer = if json_logs() {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&endpoint)
            .build()?;

        let tracer_provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .build();

        let _ = TRACER_PROVIDER.set(tracer_provider.clone());

        let tracer = tracer_provider.tracer("iceload");
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .init();

        tracing::info!(endpoint = %endpoint, "OpenTelemetry OTLP export enabled");
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    Ok(())
}

/// Shutdown telemetry and flush pending spans.
pub fn shutdown_telemetry() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Error shutting down tracer provider: {:?}", e);
        }
    }
}

fn json_logs() -> bool {
    std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// `RUST_LOG` wins; otherwise `LOG_LEVEL` (e.g. `INFO`) sets the default level.
fn build_filter(rust_log: Option<&str>, log_level: Option<&str>) -> EnvFilter {
    if let Some(directives) = rust_log.filter(|s| !s.trim().is_empty()) {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return filter;
        }
    }

    let level = log_level
        .and_then(|l| l.trim().parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::default().add_directive(level.into())
}
