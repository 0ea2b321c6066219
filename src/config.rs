// Pipeline configuration
// Loaded from JSON; every field falls back to its default when absent

use crate::decoder::OutputFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Configuration for the decode pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of decoded-image slots, which also bounds in-flight samples
    pub pool_capacity: usize,
    /// How long a drain waits for outstanding completions
    pub drain_timeout_ms: u64,
    /// Upper bound on a blocking frame request; `None` waits indefinitely
    pub admission_timeout_ms: Option<u64>,
    pub output_format: OutputFormat,
    pub require_hardware: bool,
    /// Presentation rate for the paced driver
    pub fps: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 4,
            drain_timeout_ms: 2_000,
            admission_timeout_ms: None,
            output_format: OutputFormat::Nv12,
            require_hardware: false,
            fps: 30,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        log::info!("Loaded pipeline config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_capacity == 0 {
            return Err(ConfigError::Invalid("pool_capacity must be at least 1".to_string()));
        }
        if self.drain_timeout_ms == 0 {
            return Err(ConfigError::Invalid("drain_timeout_ms must be positive".to_string()));
        }
        if self.fps == 0 || self.fps > 240 {
            return Err(ConfigError::Invalid(format!("fps must be in 1..=240, got {}", self.fps)));
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn admission_timeout(&self) -> Option<Duration> {
        self.admission_timeout_ms.map(Duration::from_millis)
    }

    /// Time between presented frames
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.fps.max(1)))
    }
}
