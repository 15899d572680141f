//! flowq configuration
//!
//! Defaults for queue capacity, worker count, deadline and log level, read
//! from a TOML file. CLI flags override whatever the file sets.
//!
//! ```toml
//! queue_capacity = 32
//! workers = 4
//! timeout_ms = 2000
//! log_level = "debug"
//! ```
//!
//! # Usage
//!
//! ```rust
//! use flowq::util::config::FlowConfig;
//!
//! let config = FlowConfig::from_toml_str("workers = 2").unwrap();
//! assert_eq!(config.workers, 2);
//! assert_eq!(config.queue_capacity, 16);
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::flow::FlowError;
use crate::util::logger::LogLevel;

/// Runtime configuration shared by the CLI demos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Capacity of every queue the demos create
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Workers per pool / stage
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Deadline for the whole run, in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Subscriber level
    #[serde(default)]
    pub log_level: LogLevel,
}

fn default_queue_capacity() -> usize {
    16
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
            timeout_ms: None,
            log_level: LogLevel::default(),
        }
    }
}

impl FlowConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FlowConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject values the flow constructors would reject.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(FlowError::InvalidCapacity(self.queue_capacity).into());
        }
        if self.workers == 0 {
            return Err(FlowError::InvalidWorkerCount(self.workers).into());
        }
        Ok(())
    }

    /// The configured deadline, if any.
    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(#[from] FlowError),
}

#[cfg(test)]
mod tests;
