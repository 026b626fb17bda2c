//! Tracing subscriber setup.

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Output format for log lines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Logging configuration, loaded from `LOG_*` variables.
#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `stream_orchestrator=debug`
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::Plain,
        }
    }
}

pub fn load_logging_config_from_env() -> Result<LoggingConfig, envy::Error> {
    envy::prefixed("LOG_").from_env::<LoggingConfig>()
}

/// Install the global subscriber. `RUST_LOG` wins over `conf.level` when set.
pub fn tracing_init(conf: LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&conf.level))
        .map_err(|e| anyhow::anyhow!("invalid log filter {:?}: {}", conf.level, e))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    // a second init (tests, embedded use) keeps the first subscriber
    let result = match conf.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Plain => builder.try_init(),
    };
    if let Err(e) = result {
        tracing::debug!("tracing subscriber already installed: {}", e);
    }
    Ok(())
}
