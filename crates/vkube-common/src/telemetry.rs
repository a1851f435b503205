//! Telemetry initialization: JSON logs, optional OTLP traces and metrics
//!
//! Logs always go to stdout as JSON with the current span attached. When
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set, spans and metrics are exported over
//! OTLP/gRPC as well.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{Tracer, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default log filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,vkube=debug,kube=info,tower=warn,hyper=warn";

/// Telemetry setup failure
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter for `signal` (traces or metrics) could not be built
    #[error("build OTLP {signal} exporter: {message}")]
    Exporter {
        /// `traces` or `metrics`
        signal: &'static str,
        /// Exporter error
        message: String,
    },

    /// A global subscriber was already installed
    #[error("install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Telemetry settings of one syncer process
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name` resource attribute and tracer name
    pub service_name: String,
    /// Virtual cluster instance, recorded as `vkube.instance`
    pub instance: Option<String>,
    /// OTLP/gRPC collector; without one nothing is exported
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "vkube-syncer".to_string(),
            instance: None,
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        }
    }
}

/// Install the global subscriber, plus OTLP export when an endpoint is set
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let tracer = install_otlp(endpoint, &config)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json_logs = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(json_logs)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

/// Resource attributes: service identity, instance and the Downward API env
fn resource_for(config: &TelemetryConfig) -> Resource {
    use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};

    let downward = [
        ("POD_NAME", "k8s.pod.name"),
        ("POD_NAMESPACE", "k8s.namespace.name"),
        ("NODE_NAME", "k8s.node.name"),
    ]
    .into_iter()
    .filter_map(|(var, key)| std::env::var(var).ok().map(|value| KeyValue::new(key, value)));

    let attributes: Vec<KeyValue> = [
        KeyValue::new(SERVICE_NAME, config.service_name.clone()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ]
    .into_iter()
    .chain(config.instance.clone().map(|i| KeyValue::new("vkube.instance", i)))
    .chain(downward)
    .collect();
    Resource::new(attributes)
}

fn exporter_error<E: std::fmt::Display>(signal: &'static str) -> impl Fn(E) -> TelemetryError {
    move |e| TelemetryError::Exporter {
        signal,
        message: e.to_string(),
    }
}

/// Register global tracer and meter providers exporting to `endpoint`
fn install_otlp(endpoint: &str, config: &TelemetryConfig) -> Result<Tracer, TelemetryError> {
    let resource = resource_for(config);

    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("traces"))?;
    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(spans, runtime::Tokio)
        .with_resource(resource.clone())
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("metrics"))?;
    global::set_meter_provider(
        SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(metrics, runtime::Tokio).build())
            .with_resource(resource)
            .build(),
    );

    Ok(tracer_provider.tracer(config.service_name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_carries_instance_and_version() {
        let config = TelemetryConfig {
            service_name: "vkube-syncer".to_string(),
            instance: Some("tenant-a".to_string()),
            otlp_endpoint: None,
        };
        let resource = resource_for(&config);
        assert!(!resource.is_empty());
        assert_eq!(
            resource
                .get(opentelemetry::Key::new("vkube.instance"))
                .map(|v| v.to_string()),
            Some("tenant-a".to_string())
        );
        assert!(resource
            .get(opentelemetry::Key::new(
                opentelemetry_semantic_conventions::resource::SERVICE_VERSION
            ))
            .is_some());
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }
}
