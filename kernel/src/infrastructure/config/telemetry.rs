//! Telemetry configuration for the barrier kernel.
//!
//! This module defines OpenTelemetry and observability settings.

use serde::Deserialize;

/// Telemetry configuration settings.
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetrySettings {
    /// Service name for telemetry.
    pub service_name: String,
    /// OTLP endpoint for traces.
    pub otlp_endpoint: Option<String>,
    /// Sampling ratio for traces.
    #[serde(default = "default_sampling")]
    pub sampling_ratio: f64,
    /// Default log filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Address of the Prometheus scrape endpoint, e.g. `0.0.0.0:9464`.
    pub metrics_listen: Option<String>,
}

fn default_sampling() -> f64 {
    1.0
}

fn default_log_level() -> String {
    "info".to_string()
}
