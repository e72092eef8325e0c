//! Optional YAML configuration for the service binary.

use std::path::Path;

use serde::{Deserialize, Serialize};
use streak_engine_core::EngineConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceConfig {
    pub engine: EngineConfig,
    /// Seconds between settlement runs; no timer when unset.
    pub settlement_interval_secs: Option<u64>,
}

impl ServiceConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(content.as_str())
    }

    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        path.map_or_else(|| Ok(Self::default()), Self::from_path)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.settlement_chunk_size == 0 {
            return Err(ConfigError::Validation(
                "engine.settlement_chunk_size must be at least 1".into(),
            ));
        }
        if self.settlement_interval_secs == Some(0) {
            return Err(ConfigError::Validation(
                "settlement_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
