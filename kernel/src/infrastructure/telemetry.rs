use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{propagation::TraceContextPropagator, trace::Sampler, Resource};
use opentelemetry_semantic_conventions::resource;
use std::net::SocketAddr;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use super::config::TelemetrySettings;

/// Builder for setting up telemetry (Logging, Tracing, Metrics).
pub struct TelemetryBuilder {
    service_name: String,
    service_version: String,
    enable_tracing: bool,
    otlp_endpoint: Option<String>,
    metrics_listen: Option<SocketAddr>,
    log_level: String,
    sampling_ratio: f64,
}

impl TelemetryBuilder {
    /// JSON logging only, at `info`.
    pub fn new(service_name: impl Into<String>, service_version: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: service_version.into(),
            enable_tracing: false,
            otlp_endpoint: None,
            metrics_listen: None,
            log_level: "info".to_string(),
            sampling_ratio: 1.0,
        }
    }

    /// Builder configured from settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics listen address does not parse.
    pub fn from_settings(settings: &TelemetrySettings, service_version: &str) -> Result<Self> {
        let mut builder = Self::new(settings.service_name.clone(), service_version)
            .with_log_level(settings.log_level.clone())
            .with_sampling_ratio(settings.sampling_ratio);
        if let Some(endpoint) = &settings.otlp_endpoint {
            builder = builder.with_tracing(endpoint.clone());
        }
        if let Some(listen) = &settings.metrics_listen {
            let addr = listen
                .parse()
                .with_context(|| format!("Invalid metrics listen address '{listen}'"))?;
            builder = builder.with_metrics(addr);
        }
        Ok(builder)
    }

    /// Exports spans to an OTLP collector.
    #[must_use]
    pub fn with_tracing(mut self, endpoint: impl Into<String>) -> Self {
        self.enable_tracing = true;
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    /// Serves Prometheus metrics on `listen`.
    #[must_use]
    pub fn with_metrics(mut self, listen: SocketAddr) -> Self {
        self.metrics_listen = Some(listen);
        self
    }

    /// Default log filter when `RUST_LOG` is unset.
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Trace sampling ratio for root spans.
    #[must_use]
    pub fn with_sampling_ratio(mut self, ratio: f64) -> Self {
        self.sampling_ratio = ratio;
        self
    }

    /// Initializes the telemetry system with configured exporters.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The Prometheus exporter cannot be installed
    /// - The OTLP span exporter cannot be built
    /// - The tracing subscriber cannot be initialized
    pub fn init(self) -> Result<()> {
        if let Some(listen) = self.metrics_listen {
            PrometheusBuilder::new()
                .with_http_listener(listen)
                .install()
                .context("Failed to install Prometheus exporter")?;
        }

        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level));

        let fmt_layer = fmt::layer().json().with_span_events(FmtSpan::CLOSE).boxed();

        let registry = Registry::default().with(env_filter).with(fmt_layer);

        match self.otlp_endpoint.filter(|_| self.enable_tracing) {
            Some(endpoint) => {
                let resource = Resource::builder()
                    .with_attributes(vec![
                        opentelemetry::KeyValue::new(
                            resource::SERVICE_NAME,
                            self.service_name.clone(),
                        ),
                        opentelemetry::KeyValue::new(
                            resource::SERVICE_VERSION,
                            self.service_version.clone(),
                        ),
                    ])
                    .build();

                let exporter = opentelemetry_otlp::SpanExporter::builder()
                    .with_tonic()
                    .with_endpoint(endpoint)
                    .build()
                    .context("Failed to build OTLP span exporter")?;

                let processor =
                    opentelemetry_sdk::trace::BatchSpanProcessor::builder(exporter).build();

                let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
                    .with_span_processor(processor)
                    .with_resource(resource)
                    .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                        self.sampling_ratio,
                    ))))
                    .build();

                opentelemetry::global::set_tracer_provider(provider.clone());

                let tracer = provider.tracer("barrier-kernel");

                let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

                registry
                    .with(telemetry_layer)
                    .try_init()
                    .context("Failed to init subscriber")?;
            }
            None => registry.try_init().context("Failed to init subscriber")?,
        }

        Ok(())
    }
}
