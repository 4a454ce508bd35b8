// Configuration File Support
//
// This module provides configuration file parsing for the agentmesh binary.
// Supports TOML format with environment variable overrides.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::logging::LoggingConfig;
use crate::mesh::MeshConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Mesh configuration
    pub mesh: MeshConfig,
}

impl Config {
    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or
    /// if the resulting configuration is invalid. If the config file does
    /// not exist, defaults (plus environment overrides) are used.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - AGENTMESH_LOG_LEVEL, AGENTMESH_LOG_FORMAT
    /// - AGENTMESH_ROLE, AGENTMESH_DEVICE
    /// - AGENTMESH_DISCOVERY_PORT, AGENTMESH_DATA_PORT
    /// - AGENTMESH_BROADCAST_ADDRESS
    fn apply_env_overrides(self) -> Self {
        Self {
            logging: self.logging.apply_env_overrides(),
            mesh: self.mesh.apply_env_overrides(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.mesh
            .validate()
            .map_err(|e| anyhow!("Invalid mesh configuration: {}", e))
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
