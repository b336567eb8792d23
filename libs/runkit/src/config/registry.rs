//! Named source factories.
//!
//! Backends are made available by registering a factory under a name; the
//! settings file then selects one by that name. Nothing registers itself.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use super::Env;
use super::source::{Source, SourceError, WatchCallback};
use crate::tasks::TaskLauncher;

/// Inputs handed to a source factory.
#[derive(Clone)]
pub struct SourceInit {
    pub env: Env,
    pub app_name: String,
    /// Source holding the backend's own settings (the local file).
    pub bootstrap: Arc<dyn Source>,
}

type SourceFactory =
    Arc<dyn Fn(SourceInit) -> BoxFuture<'static, anyhow::Result<Arc<dyn Source>>> + Send + Sync>;

/// Table of source factories, keyed by backend name.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    factories: HashMap<String, SourceFactory>,
}

impl SourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(SourceInit) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<dyn Source>>> + Send + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            tracing::warn!(source = %name, "Replacing registered config source factory");
        }
        self.factories
            .insert(name, Arc::new(move |init| Box::pin(factory(init))));
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Wrap the factory registered as `name` in a source built on first use.
    pub(crate) fn lazy(&self, name: &str, init: SourceInit) -> Option<LazySource> {
        self.factories.get(name).map(|factory| LazySource {
            name: name.to_owned(),
            factory: Arc::clone(factory),
            init,
            cell: OnceCell::new(),
        })
    }
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("SourceRegistry")
            .field("factories", &names)
            .finish()
    }
}

/// A source constructed by its factory the first time it is used.
///
/// A failed construction is not cached; the next operation retries it.
pub(crate) struct LazySource {
    name: String,
    factory: SourceFactory,
    init: SourceInit,
    cell: OnceCell<Arc<dyn Source>>,
}

impl LazySource {
    async fn get(&self, key: &str) -> Result<&Arc<dyn Source>, SourceError> {
        self.cell
            .get_or_try_init(|| async {
                tracing::info!(source = %self.name, "Initializing config source");
                (self.factory)(self.init.clone()).await
            })
            .await
            .map_err(|source| SourceError::Backend {
                key: key.to_owned(),
                source,
            })
    }
}

#[async_trait]
impl Source for LazySource {
    fn name(&self) -> &str {
        &self.name
    }

    /// Unknown until the backend is built; the inner source does its own write-back.
    fn is_persistent(&self) -> bool {
        self.cell.get().is_some_and(|s| s.is_persistent())
    }

    async fn scan(&self, key: &str, target: &mut Value) -> Result<(), SourceError> {
        self.get(key).await?.scan(key, target).await
    }

    async fn has(&self, key: &str) -> Result<bool, SourceError> {
        self.get(key).await?.has(key).await
    }

    async fn watch(
        &self,
        tasks: &TaskLauncher,
        cancel: CancellationToken,
        key: &str,
        callback: WatchCallback,
    ) -> Result<(), SourceError> {
        self.get(key).await?.watch(tasks, cancel, key, callback).await
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::sources::MemorySource;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn init() -> SourceInit {
        SourceInit {
            env: Env::Dev,
            app_name: "app".to_owned(),
            bootstrap: Arc::new(MemorySource::new()),
        }
    }

    #[tokio::test]
    async fn lazy_source_builds_once_on_first_use() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let mut registry = SourceRegistry::new();
        registry.register("mem", move |_init| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                let mem = MemorySource::new();
                mem.set("cache", json!({"Type": "memory"}));
                Ok::<_, anyhow::Error>(Arc::new(mem) as Arc<dyn Source>)
            }
        });

        let lazy = registry.lazy("mem", init()).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 0);
        assert!(!lazy.is_persistent());

        assert!(lazy.has("cache").await.unwrap());
        let mut value = Value::Null;
        lazy.scan("cache", &mut value).await.unwrap();
        assert_eq!(value, json!({"Type": "memory"}));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn factory_failure_surfaces_as_backend_error() {
        let mut registry = SourceRegistry::new();
        registry.register("broken", |_init| async {
            Err::<Arc<dyn Source>, _>(anyhow::anyhow!("unreachable endpoint"))
        });

        let lazy = registry.lazy("broken", init()).unwrap();
        let err = lazy.has("cache").await.unwrap_err();
        assert!(matches!(err, SourceError::Backend { ref key, .. } if key == "cache"));
    }

    #[test]
    fn unknown_name_has_no_lazy_source() {
        let registry = SourceRegistry::new();
        assert!(!registry.contains("kv"));
        assert!(registry.lazy("kv", init()).is_none());
    }
}
