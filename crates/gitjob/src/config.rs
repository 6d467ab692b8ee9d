//! Controller configuration.
//!
//! Loaded from a YAML file, then overridden from `GITJOB_*` environment
//! variables, then validated.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GitJobError, Result};

pub const ENV_IMAGE: &str = "GITJOB_IMAGE";
pub const ENV_POLL_INTERVAL: &str = "GITJOB_POLL_INTERVAL";
pub const ENV_LOG_LEVEL: &str = "GITJOB_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "GITJOB_LOG_FORMAT";

/// Top-level controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Image for the clone init container.
    #[serde(default)]
    pub image: String,

    /// Poll interval in seconds for GitJobs that do not set one.
    #[serde(default = "default_polling_interval")]
    pub default_polling_interval: u64,

    /// Timeout in seconds for a single remote lookup.
    #[serde(default = "default_git_timeout")]
    pub git_timeout: u64,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_polling_interval() -> u64 {
    15
}

fn default_git_timeout() -> u64 {
    30
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            default_polling_interval: default_polling_interval(),
            git_timeout: default_git_timeout(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            log: LogConfig::default(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// Default filter directive, e.g. `info` or `gitjob=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = GitJobError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(GitJobError::InvalidConfig(format!(
                "unknown log format '{}', expected 'text' or 'json'",
                other
            ))),
        }
    }
}

impl ControllerConfig {
    /// Reads, overrides and validates a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| GitJobError::ReadConfig {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a config from defaults plus environment overrides only.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(image) = env_value(ENV_IMAGE) {
            self.image = image;
        }
        if let Some(interval) = env_value(ENV_POLL_INTERVAL) {
            self.default_polling_interval = interval.parse().map_err(|_| {
                GitJobError::InvalidConfig(format!(
                    "{} must be a number of seconds, got '{}'",
                    ENV_POLL_INTERVAL, interval
                ))
            })?;
        }
        if let Some(level) = env_value(ENV_LOG_LEVEL) {
            self.log.level = level;
        }
        if let Some(format) = env_value(ENV_LOG_FORMAT) {
            self.log.format = format.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(GitJobError::InvalidConfig(
                "image must be set".to_string(),
            ));
        }
        if self.default_polling_interval == 0 {
            return Err(GitJobError::InvalidConfig(
                "defaultPollingInterval must be at least 1 second".to_string(),
            ));
        }
        if self.git_timeout == 0 {
            return Err(GitJobError::InvalidConfig(
                "gitTimeout must be at least 1 second".to_string(),
            ));
        }
        if self.retry_base_delay_ms == 0 || self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(GitJobError::InvalidConfig(format!(
                "retryBaseDelayMs ({}) must be positive and not exceed retryMaxDelayMs ({})",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            )));
        }
        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.default_polling_interval)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
