//! Logging setup for Cadence binaries and tests.

use std::env;

pub mod logging;

pub use logging::{init_logging, init_test_tracing, LogExt};

/// Configuration for initializing logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringConfig {
    /// Service name attached to the startup record
    pub service_name: String,
    /// Log level filter (e.g., "info,cadence_core=debug"), used when
    /// `RUST_LOG` is unset
    pub log_filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "cadence".to_string(),
            log_filter: "info".to_string(),
            json: false,
        }
    }
}

impl MonitoringConfig {
    /// Defaults overridden by `CADENCE_LOG` and `CADENCE_LOG_FORMAT`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`MonitoringConfig::from_env`] over an arbitrary lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(filter) = lookup("CADENCE_LOG") {
            config.log_filter = filter;
        }
        if let Some(format) = lookup("CADENCE_LOG_FORMAT") {
            config.json = format.eq_ignore_ascii_case("json");
        }
        config
    }

    /// Replace the service name
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }
}
