//! Configuration for the Cadence engine
//!
//! This module contains the configuration types and loading functionality.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::CoreError;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on asynchronous invocations executing at once
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Pending limit used when a caller does not pass one
    #[serde(default = "default_max_pending")]
    pub default_max_pending: usize,

    /// Emit audit events through `tracing`
    #[serde(default = "default_audit_enabled")]
    pub audit_enabled: bool,

    /// Flow document loaded at startup
    #[serde(default)]
    pub flows_path: Option<PathBuf>,
}

fn default_max_workers() -> usize {
    16
}

fn default_max_pending() -> usize {
    64
}

fn default_audit_enabled() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            default_max_pending: default_max_pending(),
            audit_enabled: default_audit_enabled(),
            flows_path: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration: defaults, then the YAML file named by
    /// `CADENCE_CONFIG` if set, then environment overrides
    pub fn load() -> Result<Self, CoreError> {
        let mut config = match env::var("CADENCE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        info!(
            max_workers = config.max_workers,
            default_max_pending = config.default_max_pending,
            audit_enabled = config.audit_enabled,
            "Engine configuration loaded"
        );
        Ok(config)
    }

    /// Parse a YAML configuration file
    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CoreError::ConfigurationError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse YAML configuration text
    pub fn from_yaml_str(yaml: &str) -> Result<Self, CoreError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CoreError::ConfigurationError(format!("invalid engine config: {}", e)))
    }

    /// Apply `CADENCE_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("CADENCE_MAX_WORKERS") {
            match value.parse::<usize>() {
                Ok(workers) => self.max_workers = workers,
                Err(_) => warn!("Invalid CADENCE_MAX_WORKERS value: {}", value),
            }
        }

        if let Some(value) = lookup("CADENCE_DEFAULT_MAX_PENDING") {
            match value.parse::<usize>() {
                Ok(pending) => self.default_max_pending = pending,
                Err(_) => warn!("Invalid CADENCE_DEFAULT_MAX_PENDING value: {}", value),
            }
        }

        if let Some(value) = lookup("CADENCE_AUDIT") {
            match value.to_lowercase().as_str() {
                "true" | "1" | "on" => self.audit_enabled = true,
                "false" | "0" | "off" => self.audit_enabled = false,
                _ => warn!("Invalid CADENCE_AUDIT value: {}", value),
            }
        }

        if let Some(path) = lookup("CADENCE_FLOWS") {
            self.flows_path = Some(PathBuf::from(path));
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_workers == 0 {
            return Err(CoreError::ConfigurationError(
                "max_workers must be at least 1".into(),
            ));
        }
        if self.default_max_pending == 0 {
            return Err(CoreError::ConfigurationError(
                "default_max_pending must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
