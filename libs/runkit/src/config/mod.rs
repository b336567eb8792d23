//! Configuration facade.
//!
//! [`Config`] is the process-wide, immutable configuration handle: environment,
//! application name, debug flag and the ordered set of source backends.
//!
//! Each section key is governed by exactly one backend: the backend explicitly
//! routed for that key, otherwise the first registered backend.
//!
//! `scan` treats the target's current value as the default. When the governing
//! backend is persistent and the section is missing, the backend stores that
//! default as the initial value and the facade still reports
//! [`ConfigError::NotFound`], so callers can tell "first run, defaults applied"
//! apart from a configured deployment.

mod error;
mod registry;
mod settings;
mod source;

pub use error::ConfigError;
pub use registry::{SourceInit, SourceRegistry};
pub use settings::{ENV_PREFIX, Settings};
pub use source::{ChangeEvent, Format, Source, SourceError, WatchCallback};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::sources::MemorySource;
use crate::tasks::TaskLauncher;

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    #[default]
    Dev,
    Test,
    Pre,
    Prod,
}

impl Env {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Test => "test",
            Self::Pre => "pre",
            Self::Prod => "prod",
        }
    }
}

impl fmt::Display for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct NamedSource {
    name: String,
    source: Arc<dyn Source>,
}

/// Process-wide configuration handle.
pub struct Config {
    app_name: String,
    env: Env,
    debug: bool,
    sources: Vec<NamedSource>,
    routes: HashMap<String, usize>,
}

/// Builder for [`Config`].
pub struct ConfigBuilder {
    app_name: String,
    env: Env,
    debug: bool,
    sources: Vec<NamedSource>,
    routes: Vec<(String, String)>,
}

impl ConfigBuilder {
    #[must_use]
    pub fn env(mut self, env: Env) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Register a source backend. The first one registered governs every
    /// section that has no explicit route.
    #[must_use]
    pub fn source(mut self, name: impl Into<String>, source: Arc<dyn Source>) -> Self {
        self.sources.push(NamedSource {
            name: name.into(),
            source,
        });
        self
    }

    /// Route `section` to the source registered as `source_name`.
    #[must_use]
    pub fn route(mut self, section: impl Into<String>, source_name: impl Into<String>) -> Self {
        self.routes.push((section.into(), source_name.into()));
        self
    }

    /// Finish the configuration handle.
    ///
    /// A configuration without sources is backed by an empty in-memory source.
    ///
    /// # Errors
    /// Returns [`ConfigError::UnknownSource`] if a route names an unregistered source.
    pub fn try_build(self) -> Result<Config, ConfigError> {
        let (config, mut unknown) = self.finish();
        match unknown.pop() {
            Some((_, name)) => Err(ConfigError::UnknownSource { name }),
            None => Ok(config),
        }
    }

    /// Like [`ConfigBuilder::try_build`], but routes naming an unregistered
    /// source are logged and dropped.
    #[must_use]
    pub fn build(self) -> Config {
        let (config, unknown) = self.finish();
        for (section, source) in unknown {
            tracing::warn!(section = %section, source = %source, "Ignoring route to unregistered config source");
        }
        config
    }

    /// Resolve routes; returns the routes whose source is not registered.
    fn finish(mut self) -> (Config, Vec<(String, String)>) {
        if self.sources.is_empty() {
            self.sources.push(NamedSource {
                name: MemorySource::NAME.to_owned(),
                source: Arc::new(MemorySource::new()),
            });
        }

        let mut routes = HashMap::with_capacity(self.routes.len());
        let mut unknown = Vec::new();
        for (section, source_name) in self.routes {
            match self.sources.iter().position(|s| s.name == source_name) {
                Some(idx) => {
                    routes.insert(section, idx);
                }
                None => unknown.push((section, source_name)),
            }
        }

        let config = Config {
            app_name: self.app_name,
            env: self.env,
            debug: self.debug,
            sources: self.sources,
            routes,
        };
        (config, unknown)
    }
}

impl Config {
    #[must_use]
    pub fn builder(app_name: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            app_name: app_name.into(),
            env: Env::default(),
            debug: false,
            sources: Vec::new(),
            routes: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    #[inline]
    #[must_use]
    pub fn env(&self) -> Env {
        self.env
    }

    #[inline]
    #[must_use]
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Names of the registered sources, in registration order.
    pub fn source_names(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().map(|s| s.name.as_str())
    }

    /// Look up a registered source by name.
    #[must_use]
    pub fn source(&self, name: &str) -> Option<Arc<dyn Source>> {
        self.sources
            .iter()
            .find(|s| s.name == name)
            .map(|s| Arc::clone(&s.source))
    }

    fn governing(&self, key: &str) -> &NamedSource {
        let idx = self.routes.get(key).copied().unwrap_or(0);
        &self.sources[idx]
    }

    /// Decode section `key` into `target`, using its current value as the default.
    ///
    /// # Errors
    /// - [`ConfigError::NotFound`] if the section is missing (persistent sources
    ///   have stored the default by then; `target` is left untouched);
    /// - [`ConfigError::Decode`] / [`ConfigError::Encode`] on type mismatch;
    /// - [`ConfigError::Source`] for backend failures and timeouts.
    pub async fn scan<T>(&self, key: &str, target: &mut T) -> Result<(), ConfigError>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        let backend = self.governing(key);
        let mut raw = serde_json::to_value(&*target).map_err(|source| ConfigError::Encode {
            key: key.to_owned(),
            source,
        })?;

        backend
            .source
            .scan(key, &mut raw)
            .await
            .map_err(|e| ConfigError::from_source(key, &backend.name, e))?;

        *target = serde_json::from_value(raw).map_err(|source| ConfigError::Decode {
            key: key.to_owned(),
            source,
        })?;
        tracing::debug!(section = key, source = %backend.name, "Config section loaded");
        Ok(())
    }

    /// Lenient variant of [`Config::scan`]: a missing section yields `T::default()`.
    ///
    /// # Errors
    /// Any [`ConfigError`] other than `NotFound`.
    pub async fn scan_or_default<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: Serialize + DeserializeOwned + Default + Send,
    {
        let mut value = T::default();
        match self.scan(key, &mut value).await {
            Ok(()) => Ok(value),
            Err(e) if e.is_not_found() => {
                tracing::info!(section = key, "Config section missing; using defaults");
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    /// Check whether section `key` exists in its governing source.
    ///
    /// # Errors
    /// Returns [`ConfigError::Source`] on backend failure.
    pub async fn has(&self, key: &str) -> Result<bool, ConfigError> {
        let backend = self.governing(key);
        backend
            .source
            .has(key)
            .await
            .map_err(|e| ConfigError::from_source(key, &backend.name, e))
    }

    /// Watch section `key` on its governing source until `cancel` fires.
    ///
    /// # Errors
    /// Returns [`ConfigError::Source`] if the source cannot watch.
    pub async fn watch<F>(
        &self,
        tasks: &TaskLauncher,
        cancel: CancellationToken,
        key: &str,
        callback: F,
    ) -> Result<(), ConfigError>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let backend = self.governing(key);
        backend
            .source
            .watch(tasks, cancel, key, Arc::new(callback))
            .await
            .map_err(|e| ConfigError::from_source(key, &backend.name, e))?;
        tracing::debug!(section = key, source = %backend.name, "Watching config section");
        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("app_name", &self.app_name)
            .field("env", &self.env)
            .field("debug", &self.debug)
            .field("sources", &self.source_names().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
