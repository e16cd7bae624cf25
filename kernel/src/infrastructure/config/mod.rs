//! Configuration management for the barrier kernel.
//!
//! Sources, later ones winning: built-in defaults, an optional
//! `barrier-kernel.{toml,yaml,json}` file, then `BARRIER__*` environment
//! variables (`BARRIER__DATABASE__URL`, `BARRIER__POLLER__INTERVAL_SECS`, ...).
//!
//! # Example
//!
//! ```no_run
//! use barrier_kernel::infrastructure::config::Settings;
//!
//! let settings = Settings::new().expect("Failed to load configuration");
//! ```

pub mod database;
pub mod locking;
pub mod poller;
pub mod retry;
pub mod telemetry;

pub use database::DatabaseSettings;
pub use locking::LockingSettings;
pub use poller::PollerSettings;
pub use retry::RetrySettings;
pub use telemetry::TelemetrySettings;

use config::{
    builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File, FileFormat,
};
use serde::Deserialize;

/// Base name of the optional configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "barrier-kernel";
/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "BARRIER";

/// Top-level configuration for the barrier kernel.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Database settings.
    pub database: DatabaseSettings,
    /// Telemetry settings.
    pub telemetry: TelemetrySettings,
    /// Poller settings.
    #[serde(default)]
    pub poller: PollerSettings,
    /// Named-lock settings.
    #[serde(default)]
    pub locking: LockingSettings,
    /// Store retry settings.
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Settings {
    /// Loads settings from defaults, the optional default file and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be built or deserialized.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Loads settings, reading `path` instead of the default file. An
    /// explicit file must exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be built or deserialized.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::with_name(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        defaults()?
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Loads settings from defaults overlaid with a TOML document, ignoring
    /// files and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not parse or deserialize.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        defaults()?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("database.url", "sqlite://barrier-kernel.db")?
        .set_default("telemetry.service_name", "barrier-kernel")?
        .set_default("telemetry.sampling_ratio", 1.0)
}
