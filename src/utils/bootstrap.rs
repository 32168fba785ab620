//! Bootstrap utilities for the award service binaries.
//!
//! Installs the global tracing subscriber: an `EnvFilter`, a JSON or pretty
//! `fmt` layer and, with the `otel` feature, an OpenTelemetry layer plus the
//! W3C trace-context propagator used by the messaging layer.

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig, LOG_ENV_VAR};

/// Standard OTLP endpoint variable. Spans and metrics are exported only when set.
pub const OTLP_ENDPOINT_ENV_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Keeps telemetry providers alive. Pass to [`shutdown_tracing`] before exit.
#[must_use = "dropping the guard skips the final telemetry flush"]
pub struct TracingGuard {
    #[cfg(feature = "otel")]
    tracer_provider: opentelemetry_sdk::trace::TracerProvider,
    #[cfg(feature = "otel")]
    meter_provider: Option<opentelemetry_sdk::metrics::SdkMeterProvider>,
}

/// Filter from `STICKER_AWARD_LOG`, falling back to the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| {
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Initialize tracing for `service_name`.
pub fn init_tracing(
    config: &LoggingConfig,
    service_name: &str,
) -> Result<TracingGuard, Box<dyn std::error::Error>> {
    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().pretty().boxed(),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter(config))
        .with(fmt_layer);

    #[cfg(feature = "otel")]
    {
        use opentelemetry::trace::TracerProvider as _;

        let endpoint = std::env::var(OTLP_ENDPOINT_ENV_VAR)
            .ok()
            .filter(|e| !e.trim().is_empty());
        let (tracer_provider, meter_provider) = otel::providers(service_name, endpoint.as_deref())?;

        opentelemetry::global::set_text_map_propagator(
            opentelemetry_sdk::propagation::TraceContextPropagator::new(),
        );
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        if let Some(meter_provider) = &meter_provider {
            opentelemetry::global::set_meter_provider(meter_provider.clone());
        }

        let tracer = tracer_provider.tracer(service_name.to_string());
        registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;

        info!(
            service = %service_name,
            otlp_endpoint = ?endpoint,
            "Tracing initialized"
        );
        Ok(TracingGuard {
            tracer_provider,
            meter_provider,
        })
    }

    #[cfg(not(feature = "otel"))]
    {
        registry.try_init()?;
        info!(service = %service_name, "Tracing initialized");
        Ok(TracingGuard {})
    }
}

/// Flush and shut down telemetry providers.
pub fn shutdown_tracing(guard: TracingGuard) {
    #[cfg(feature = "otel")]
    {
        if let Err(e) = guard.tracer_provider.shutdown() {
            tracing::warn!(error = %e, "Failed to shut down tracer provider");
        }
        if let Some(meter_provider) = guard.meter_provider {
            if let Err(e) = meter_provider.shutdown() {
                tracing::warn!(error = %e, "Failed to shut down meter provider");
            }
        }
    }

    #[cfg(not(feature = "otel"))]
    drop(guard);
}

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
    use opentelemetry_sdk::trace::TracerProvider;
    use opentelemetry_sdk::{runtime, Resource};

    /// Providers for `service_name`.
    ///
    /// Spans are always recorded so trace ids exist for propagation; they
    /// are only exported when `endpoint` is set.
    pub(super) fn providers(
        service_name: &str,
        endpoint: Option<&str>,
    ) -> Result<(TracerProvider, Option<SdkMeterProvider>), Box<dyn std::error::Error>> {
        let resource = Resource::new(vec![KeyValue::new("service.name", service_name.to_string())]);

        let mut tracer_builder = TracerProvider::builder().with_resource(resource.clone());
        let mut meter_provider = None;

        if let Some(endpoint) = endpoint {
            let span_exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?;
            tracer_builder = tracer_builder.with_batch_exporter(span_exporter, runtime::Tokio);

            let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?;
            let reader = PeriodicReader::builder(metric_exporter, runtime::Tokio).build();
            meter_provider = Some(
                SdkMeterProvider::builder()
                    .with_reader(reader)
                    .with_resource(resource)
                    .build(),
            );
        }

        Ok((tracer_builder.build(), meter_provider))
    }
}
