//! Tracing subscriber setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogConfig, LogFormat};
use crate::error::{GitJobError, Result};

/// Builds the filter: `RUST_LOG` when set, otherwise the configured level.
pub fn env_filter(config: &LogConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            GitJobError::InvalidConfig(format!("invalid log level '{}': {}", config.level, e))
        }),
    }
}

/// Installs the global subscriber and forwards `log` records into it.
///
/// Fails if a global subscriber or logger is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = env_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Text => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().with_target(true)))
        }
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_current_span(true)),
        ),
    };
    installed.map_err(|e| {
        GitJobError::InvalidConfig(format!("failed to install subscriber: {}", e))
    })?;

    tracing_log::LogTracer::init()
        .map_err(|e| GitJobError::InvalidConfig(format!("failed to install log bridge: {}", e)))
}
