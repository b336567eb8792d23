use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{KvEvent, KvStore};
use crate::config::{ChangeEvent, Env, Format, Source, SourceError, WatchCallback};
use crate::tasks::{TaskLauncher, TaskOptions};

/// Upper bound on every remote read, write and watch subscription.
pub const REMOTE_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings of a KV-backed source, read from the bootstrap file.
///
/// `endpoints`, `username` and `password` address the cluster; the in-process
/// store ignores them.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvSourceConfig {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub prefix: String,
    pub format: Format,
}

impl Default for KvSourceConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_owned()],
            username: None,
            password: None,
            prefix: "runkit".to_owned(),
            format: Format::Json,
        }
    }
}

impl std::fmt::Debug for KvSourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvSourceConfig")
            .field("endpoints", &self.endpoints)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("prefix", &self.prefix)
            .field("format", &self.format)
            .finish()
    }
}

/// Persistent source over a [`KvStore`].
///
/// Section `key` lives at `<prefix>/<env>/<app>/<key>`. A missing section is
/// seeded with the caller's default, then reported as not found.
pub struct KvSource<S: KvStore> {
    store: Arc<S>,
    namespace: String,
    format: Format,
    timeout: Duration,
}

impl<S: KvStore> KvSource<S> {
    pub const NAME: &'static str = "kv";

    pub fn new(store: Arc<S>, prefix: &str, env: Env, app_name: &str) -> Self {
        Self {
            store,
            namespace: namespace(prefix, env, app_name),
            format: Format::default(),
            timeout: REMOTE_OP_TIMEOUT,
        }
    }

    pub fn from_config(store: Arc<S>, cfg: &KvSourceConfig, env: Env, app_name: &str) -> Self {
        Self::new(store, &cfg.prefix, env, app_name).with_format(cfg.format)
    }

    #[must_use]
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fully qualified store key of section `key`.
    #[must_use]
    pub fn full_key(&self, key: &str) -> String {
        format!("{}/{key}", self.namespace)
    }

    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn bounded<T, F>(&self, key: &str, deadline: Instant, op: F) -> Result<T, SourceError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout_at(deadline, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(SourceError::Backend {
                key: key.to_owned(),
                source,
            }),
            Err(_) => Err(SourceError::Timeout {
                key: key.to_owned(),
                after: self.timeout,
            }),
        }
    }
}

/// `<prefix>/<env>/<app>`, without a trailing separator.
fn namespace(prefix: &str, env: Env, app_name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        format!("{env}/{app_name}")
    } else {
        format!("{prefix}/{env}/{app_name}")
    }
}

#[async_trait]
impl<S: KvStore> Source for KvSource<S> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn scan(&self, key: &str, target: &mut Value) -> Result<(), SourceError> {
        let full_key = self.full_key(key);
        let deadline = Instant::now() + self.timeout;

        if let Some(raw) = self.bounded(key, deadline, self.store.get(&full_key)).await? {
            *target = self.format.decode(key, &raw)?;
            return Ok(());
        }

        let encoded = self.format.encode(key, target)?;
        self.bounded(key, deadline, self.store.put(&full_key, encoded))
            .await?;
        tracing::info!(key = %full_key, "Seeded missing config section with defaults");
        Err(SourceError::NotFound {
            key: key.to_owned(),
        })
    }

    async fn has(&self, key: &str) -> Result<bool, SourceError> {
        let full_key = self.full_key(key);
        let deadline = Instant::now() + self.timeout;
        let found = self.bounded(key, deadline, self.store.get(&full_key)).await?;
        Ok(found.is_some())
    }

    async fn watch(
        &self,
        tasks: &TaskLauncher,
        cancel: CancellationToken,
        key: &str,
        callback: WatchCallback,
    ) -> Result<(), SourceError> {
        let full_key = self.full_key(key);
        let deadline = Instant::now() + self.timeout;
        let mut stream = self
            .bounded(key, deadline, self.store.watch(&full_key))
            .await?;

        tasks.go(
            cancel,
            TaskOptions::named(format!("watch:kv:{full_key}")),
            move |cancel| async move {
                loop {
                    let next = tokio::select! {
                        () = cancel.cancelled() => break,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(batch)) => {
                            for event in batch {
                                callback(match event {
                                    KvEvent::Put { .. } => ChangeEvent::Update,
                                    KvEvent::Delete { .. } => ChangeEvent::Delete,
                                });
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(key = %full_key, error = %e, "KV watch stream failed; watch stopped");
                            break;
                        }
                        None => {
                            tracing::debug!(key = %full_key, "KV watch stream closed");
                            break;
                        }
                    }
                }
                Ok(())
            },
        );
        Ok(())
    }
}
