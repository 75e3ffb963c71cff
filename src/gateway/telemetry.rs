//! Tracing subscriber setup for the gateway binary.

use thiserror::Error;
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("install tracing subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
    #[cfg(feature = "otel")]
    #[error("build otlp exporter: {0}")]
    Exporter(#[from] opentelemetry_otlp::ExporterBuildError),
}

#[derive(Clone, Debug)]
pub struct TelemetrySettings {
    pub service_name: String,
    pub json_logs: bool,
    /// Used when `RUST_LOG` is unset.
    pub default_filter: String,
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            service_name: "llm-relay".to_string(),
            json_logs: false,
            default_filter: "info".to_string(),
            otlp_endpoint: None,
        }
    }
}

/// Flushes exported spans on drop.
#[derive(Debug, Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if let Some(provider) = self.provider.take() {
            let _ = provider.shutdown();
        }
    }
}

pub fn init_tracing(settings: &TelemetrySettings) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.default_filter));

    let fmt_layer = if settings.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    #[cfg(feature = "otel")]
    if let Some(endpoint) = settings.otlp_endpoint.as_deref() {
        let provider = otlp_provider(&settings.service_name, endpoint)?;
        use opentelemetry::trace::TracerProvider as _;
        let tracer = provider.tracer(settings.service_name.clone());
        registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
        return Ok(TelemetryGuard {
            provider: Some(provider),
        });
    }

    registry.try_init()?;
    if settings.otlp_endpoint.is_some() && !cfg!(feature = "otel") {
        tracing::warn!("otlp endpoint configured but the otel feature is disabled");
    }
    Ok(TelemetryGuard::default())
}

#[cfg(feature = "otel")]
fn otlp_provider(
    service_name: &str,
    endpoint: &str,
) -> Result<opentelemetry_sdk::trace::SdkTracerProvider, TelemetryError> {
    use opentelemetry_otlp::WithExportConfig as _;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint.to_string())
        .build()?;
    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder_empty()
                .with_service_name(service_name.to_string())
                .build(),
        )
        .build();
    opentelemetry::global::set_tracer_provider(provider.clone());
    Ok(provider)
}
