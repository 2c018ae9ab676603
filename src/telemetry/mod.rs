//! Tracing and OpenTelemetry setup.
//!
//! Log output always goes to stderr through `tracing-subscriber`. When an
//! OTLP endpoint is configured, spans, metrics and log records are also
//! exported there over gRPC.

pub mod metrics;
pub mod spans;

use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::config::Config;
use crate::error::{Error, Result};

/// Name reported as `service.name` and used for the tracer and meter.
pub const SERVICE_NAME: &str = "etcdq";

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`. `None` keeps
    /// everything local.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset (e.g. "info").
    pub default_level: String,
}

impl TelemetryConfig {
    /// Local-only logging at `info`, for runs without a [`Config`].
    pub fn local() -> Self {
        Self {
            endpoint: None,
            service_name: SERVICE_NAME.to_string(),
            default_level: "info".to_string(),
        }
    }
}

impl From<&Config> for TelemetryConfig {
    fn from(config: &Config) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: SERVICE_NAME.to_string(),
            default_level: config.log_level.clone(),
        }
    }
}

/// Keeps the OTLP providers alive. Dropping it flushes and shuts them down.
#[derive(Default)]
pub struct TelemetryGuard {
    providers: Option<Providers>,
}

struct Providers {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl TelemetryGuard {
    /// Push everything buffered so far to the collector.
    pub fn force_flush(&self) {
        if let Some(p) = &self.providers {
            let _ = p.tracer.force_flush();
            let _ = p.meter.force_flush();
            let _ = p.logger.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Logs first, so records emitted while shutting down still export.
        if let Some(p) = self.providers.take() {
            let _ = p.logger.shutdown();
            let _ = p.meter.shutdown();
            let _ = p.tracer.shutdown();
        }
    }
}

/// Install the global tracing subscriber (and OTLP pipelines if configured).
///
/// Hold the returned guard until the process exits.
///
/// # Errors
///
/// Fails if an OTLP exporter cannot be built, or if a global subscriber
/// is already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_level.as_str()));

    let Some(endpoint) = config.endpoint else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(subscriber_error)?;
        return Ok(TelemetryGuard::default());
    };

    let providers = otlp_providers(&endpoint, config.service_name)?;
    opentelemetry::global::set_meter_provider(providers.meter.clone());

    let tracer = providers.tracer.tracer(SERVICE_NAME);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr),
        )
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(
            opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(
                &providers.logger,
            ),
        )
        .try_init()
        .map_err(subscriber_error)?;

    Ok(TelemetryGuard {
        providers: Some(providers),
    })
}

fn otlp_providers(endpoint: &str, service_name: String) -> Result<Providers> {
    use opentelemetry_otlp::WithExportConfig as _;

    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(service_name)
        .build();

    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("span", e))?;
    let tracer = SdkTracerProvider::builder()
        .with_batch_exporter(spans)
        .with_resource(resource.clone())
        .build();

    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("metric", e))?;
    let meter = SdkMeterProvider::builder()
        .with_periodic_exporter(metrics)
        .with_resource(resource.clone())
        .build();

    let logs = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("log", e))?;
    let logger = SdkLoggerProvider::builder()
        .with_batch_exporter(logs)
        .with_resource(resource)
        .build();

    Ok(Providers {
        tracer,
        meter,
        logger,
    })
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

fn subscriber_error(e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to init tracing subscriber: {e}"))
}
