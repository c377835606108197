use std::env;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    resource::Resource,
    runtime::Tokio,
    trace::{self, Sampler},
};
use tracing::{info, warn};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type Registry = tracing_subscriber::registry::Registry;

const SAMPLING_RATE_ENV: &str = "LVFS_OTEL_SAMPLING_RATE";

#[derive(Debug)]
pub struct TelemetryGuard {
    tracer_installed: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.tracer_installed {
            global::shutdown_tracer_provider();
        }
    }
}

/// Installs the global subscriber: env-filtered console logs, plus an OTLP
/// trace exporter when `LVFS_OTEL_SAMPLING_RATE` is positive.
pub fn init(service_name: &str) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (sampling_rate, sampling_warning) =
        parse_sampling_rate(env::var(SAMPLING_RATE_ENV).ok().as_deref());

    let (otel_layer, otel_error) = match build_otel_layer(service_name, sampling_rate) {
        Ok(layer) => (layer, None),
        Err(error) => (None, Some(error)),
    };
    let guard = TelemetryGuard {
        tracer_installed: otel_layer.is_some(),
    };

    tracing_subscriber::registry()
        .with(otel_layer)
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(message) = sampling_warning {
        warn!("{message}");
    }

    if let Some(error) = otel_error {
        warn!(%error, "failed to initialize OTEL exporter; continuing with console logs only");
    }

    info!(sampling_rate, "telemetry sampling configured");

    Ok(guard)
}

fn build_otel_layer(
    service_name: &str,
    sampling_rate: f64,
) -> Result<Option<OpenTelemetryLayer<Registry, trace::Tracer>>> {
    if sampling_rate <= 0.0 {
        return Ok(None);
    }

    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = opentelemetry_otlp::new_exporter().tonic();
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            trace::config()
                .with_sampler(Sampler::TraceIdRatioBased(sampling_rate))
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .with_exporter(exporter)
        .install_batch(Tokio)?;

    Ok(Some(tracing_opentelemetry::layer().with_tracer(tracer)))
}

/// Parses the sampling ratio. Unset means export is disabled; anything else
/// is clamped to `0.0..=1.0` with a warning for the caller to log.
pub fn parse_sampling_rate(raw: Option<&str>) -> (f64, Option<String>) {
    let Some(value) = raw else {
        return (0.0, None);
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return (
            0.0,
            Some(format!("{SAMPLING_RATE_ENV} is empty; tracing export disabled")),
        );
    }

    match trimmed.parse::<f64>().ok().filter(|parsed| !parsed.is_nan()) {
        Some(parsed) if (0.0..=1.0).contains(&parsed) => (parsed, None),
        Some(parsed) => {
            let clamped = parsed.clamp(0.0, 1.0);
            (
                clamped,
                Some(format!(
                    "{SAMPLING_RATE_ENV}={trimmed} outside 0.0..=1.0; clamped to {clamped}"
                )),
            )
        }
        None => (
            0.0,
            Some(format!(
                "{SAMPLING_RATE_ENV}='{trimmed}' is not a valid float; tracing export disabled"
            )),
        ),
    }
}
