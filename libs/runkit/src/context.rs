use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ChangeEvent, Config, ConfigError};
use crate::tasks::{TaskExit, TaskLauncher, TaskOptions};

/// Component execution context - the interface components use to reach runtime resources.
///
/// Passed to `Component::start` / `CancellableComponent::start_cancel`. Provides:
/// - **Configuration**: the shared [`Config`] facade (`scan`, `has`, `watch`)
/// - **Lifecycle**: a child of the process cancellation token
/// - **Background work**: the process [`TaskLauncher`]
///
/// ```ignore
/// async fn start(&self, ctx: &ComponentCtx) -> anyhow::Result<()> {
///     let cfg: CacheConfig = ctx.config().scan_or_default("cache").await?;
///     ctx.spawn(TaskOptions::named("cache-janitor"), move |cancel| async move {
///         janitor(cfg, cancel).await
///     });
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ComponentCtx {
    component: Arc<str>,
    config: Arc<Config>,
    cancellation_token: CancellationToken,
    tasks: TaskLauncher,
}

/// Factory for per-component contexts.
///
/// Created once by the orchestrator; every context gets its own child token of
/// the process root, so a component can observe shutdown but never trigger it.
pub(crate) struct ContextBuilder {
    config: Arc<Config>,
    tasks: TaskLauncher,
    root_token: CancellationToken,
}

impl ContextBuilder {
    pub(crate) fn new(config: Arc<Config>, tasks: TaskLauncher, root_token: CancellationToken) -> Self {
        Self {
            config,
            tasks,
            root_token,
        }
    }

    pub(crate) fn for_component(&self, name: &str) -> ComponentCtx {
        ComponentCtx::new(
            name,
            Arc::clone(&self.config),
            self.root_token.child_token(),
            self.tasks.clone(),
        )
    }
}

impl ComponentCtx {
    pub fn new(
        component: impl Into<Arc<str>>,
        config: Arc<Config>,
        cancellation_token: CancellationToken,
        tasks: TaskLauncher,
    ) -> Self {
        Self {
            component: component.into(),
            config,
            cancellation_token,
            tasks,
        }
    }

    #[inline]
    #[must_use]
    pub fn component_name(&self) -> &str {
        &self.component
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared handle to the configuration, for moving into background tasks.
    #[inline]
    #[must_use]
    pub fn config_handle(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Cancelled when the process shuts down.
    #[inline]
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    #[inline]
    #[must_use]
    pub fn tasks(&self) -> &TaskLauncher {
        &self.tasks
    }

    /// Launch a supervised task bound to this component's cancellation token.
    pub fn spawn<F, Fut>(&self, options: TaskOptions, f: F) -> JoinHandle<TaskExit>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tasks
            .go(self.cancellation_token.child_token(), options, f)
    }

    /// Shorthand for [`Config::scan`].
    ///
    /// # Errors
    /// See [`Config::scan`].
    pub async fn scan<T>(&self, key: &str, target: &mut T) -> Result<(), ConfigError>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        self.config.scan(key, target).await
    }

    /// Watch a configuration section for as long as this component is alive.
    ///
    /// # Errors
    /// Returns an error if the governing source cannot start watching.
    pub async fn watch_config<F>(&self, key: &str, callback: F) -> Result<(), ConfigError>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        self.config
            .watch(&self.tasks, self.cancellation_token.clone(), key, callback)
            .await
    }
}

impl std::fmt::Debug for ComponentCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentCtx")
            .field("component", &self.component)
            .field("cancelled", &self.cancellation_token.is_cancelled())
            .finish_non_exhaustive()
    }
}
