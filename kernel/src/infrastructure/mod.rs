/// Audit logging for barrier lifecycle events.
pub mod audit;
/// Configuration management for the kernel.
pub mod config;
/// Telemetry setup for logging, tracing, and metrics.
pub mod telemetry;
