//! Bootstrap settings and file-backed configuration loading.
//!
//! Precedence: defaults -> YAML file -> environment (`RUNKIT__*`, `__` nests).
//! Environment overrides apply to the bootstrap settings below; application
//! sections are served by the file (or the selected remote backend).

use figment::Figment;
use figment::providers::{Env as EnvProvider, Format as _, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use super::registry::{SourceInit, SourceRegistry};
use super::{Config, ConfigError, Env};
use crate::logging::LoggingConfig;
use crate::sources::FileSource;

/// Prefix of environment variables overriding bootstrap settings.
pub const ENV_PREFIX: &str = "RUNKIT__";

fn default_source() -> String {
    FileSource::NAME.to_owned()
}

/// Process bootstrap settings, read from the top level of the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub env: Env,
    pub debug: bool,
    /// Backend serving application sections: `file` or a registered factory name.
    #[serde(default = "default_source")]
    pub source: String,
    pub logging: LoggingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env: Env::default(),
            debug: false,
            source: default_source(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Settings {
    /// Layered provider chain for the settings stored at `path`.
    #[must_use]
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Yaml::file(path))
            .merge(EnvProvider::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load settings from `path` plus environment overrides.
    ///
    /// # Errors
    /// Returns [`ConfigError::Load`] if a layer is malformed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_figment(&Self::figment(path))
    }

    /// # Errors
    /// Returns [`ConfigError::Load`] if extraction fails.
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        figment.extract().map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Render as YAML, for `--print-config` style diagnostics.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_saphyr::to_string(self)?)
    }
}

impl Config {
    /// Load settings from `path` and build the configuration they describe.
    ///
    /// # Errors
    /// See [`Settings::load`] and [`Config::from_settings`].
    pub fn load(
        app_name: impl Into<String>,
        path: &Path,
        registry: &SourceRegistry,
    ) -> Result<Self, ConfigError> {
        let settings = Settings::load(path)?;
        Self::from_settings(app_name, &settings, path, registry)
    }

    /// Build a configuration from already loaded `settings`.
    ///
    /// The file at `path` is always registered as the `file` source. When
    /// `settings.source` names another backend, that backend becomes the
    /// primary source (built on first use) and the section carrying its own
    /// settings, named after it, stays in the file.
    ///
    /// # Errors
    /// - [`ConfigError::Source`] if the file cannot be read or parsed;
    /// - [`ConfigError::UnknownSource`] if `settings.source` is not registered.
    pub fn from_settings(
        app_name: impl Into<String>,
        settings: &Settings,
        path: &Path,
        registry: &SourceRegistry,
    ) -> Result<Self, ConfigError> {
        let app_name = app_name.into();
        let file = Arc::new(FileSource::open(path).map_err(|e| {
            ConfigError::from_source(&path.display().to_string(), FileSource::NAME, e)
        })?);

        let builder = Self::builder(app_name.clone())
            .env(settings.env)
            .debug(settings.debug);

        let builder = if settings.source == FileSource::NAME {
            builder.source(FileSource::NAME, file)
        } else {
            let init = SourceInit {
                env: settings.env,
                app_name: app_name.clone(),
                bootstrap: file.clone(),
            };
            let primary =
                registry
                    .lazy(&settings.source, init)
                    .ok_or_else(|| ConfigError::UnknownSource {
                        name: settings.source.clone(),
                    })?;
            builder
                .source(settings.source.clone(), Arc::new(primary))
                .source(FileSource::NAME, file)
                .route(settings.source.clone(), FileSource::NAME)
        };

        let config = builder.try_build()?;
        tracing::info!(
            app = %app_name,
            env = %settings.env,
            source = %settings.source,
            path = %path.display(),
            "Configuration loaded"
        );
        Ok(config)
    }
}
