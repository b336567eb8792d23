//! Process logging setup on top of `tracing-subscriber`.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output encoding of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `runkit=debug,warn`. `RUST_LOG` wins when set.
    pub level: Option<String>,
    pub format: LogFormat,
}

impl LoggingConfig {
    /// Filter directive used when `RUST_LOG` is absent.
    #[must_use]
    pub fn directive(&self, debug: bool) -> &str {
        match (self.level.as_deref(), debug) {
            (Some(level), _) => level,
            (None, true) => "debug",
            (None, false) => "info",
        }
    }
}

/// Install the global subscriber.
///
/// # Errors
/// Returns an error if the directive is invalid or a global subscriber is
/// already installed.
pub fn init_logging(cfg: &LoggingConfig, debug: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(cfg.directive(debug))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match cfg.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(())
}
