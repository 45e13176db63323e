//! Agent configuration
//!
//! Two sources: the agent argument string (`prefix[,key=value...]`) and a
//! TOML file. Unset keys take their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::instrument::NotifyStrategy;

pub const DEFAULT_OUTPUT: &str = "executedClasses.txt";
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown agent option '{0}' (expected output, interval or strategy)")]
    UnknownOption(String),

    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Runtime settings of the coverage agent
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Class name prefix considered "ours"; empty instruments nothing
    pub prefix: String,
    /// Snapshot file
    pub output: PathBuf,
    pub flush_interval_ms: u64,
    pub strategy: NotifyStrategy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            output: PathBuf::from(DEFAULT_OUTPUT),
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            strategy: NotifyStrategy::Direct,
        }
    }
}

impl AgentConfig {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Parse `prefix[,output=PATH][,interval=MS][,strategy=direct|call-site]`.
    ///
    /// A missing argument leaves the prefix empty.
    pub fn from_agent_args(args: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let Some(args) = args else {
            return Ok(config);
        };

        let mut parts = args.split(',');
        config.prefix = parts.next().unwrap_or_default().trim().to_string();
        for part in parts.map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| ConfigError::UnknownOption(part.to_string()))?;
            match key.trim() {
                "output" => config.output = PathBuf::from(value.trim()),
                "interval" => {
                    config.flush_interval_ms =
                        value
                            .trim()
                            .parse()
                            .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                                key: "interval",
                                value: value.to_string(),
                                reason: e.to_string(),
                            })?
                }
                "strategy" => {
                    config.strategy =
                        value
                            .parse()
                            .map_err(|reason| ConfigError::InvalidValue {
                                key: "strategy",
                                value: value.to_string(),
                                reason,
                            })?
                }
                other => return Err(ConfigError::UnknownOption(other.to_string())),
            }
        }
        config.validate()
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str::<Self>(source)?.validate()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "interval",
                value: "0".into(),
                reason: "must be at least 1 ms".into(),
            });
        }
        if self.output.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "output",
                value: String::new(),
                reason: "must not be empty".into(),
            });
        }
        Ok(self)
    }
}
