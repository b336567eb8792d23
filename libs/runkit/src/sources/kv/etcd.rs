use anyhow::Context;
use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, WatchResponse};
use futures::StreamExt;
use std::time::Duration;

use super::source::KvSourceConfig;
use super::{KvEvent, KvStore, KvWatchStream};

/// Dial timeout and keep-alive interval of the etcd connection.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const KEEP_ALIVE: Duration = Duration::from_secs(10);

/// [`KvStore`] over an etcd v3 cluster.
///
/// The gRPC client is multiplexed; every call works on a cheap clone of it.
#[derive(Clone)]
pub struct EtcdKvStore {
    client: Client,
}

impl EtcdKvStore {
    /// Connect to `cfg.endpoints`, authenticating when `cfg.username` is set.
    ///
    /// # Errors
    /// Fails if no endpoint is configured or the cluster cannot be reached
    /// within the dial timeout.
    pub async fn connect(cfg: &KvSourceConfig) -> anyhow::Result<Self> {
        if cfg.endpoints.is_empty() {
            anyhow::bail!("no etcd endpoints configured");
        }
        let client = Client::connect(cfg.endpoints.as_slice(), Some(connect_options(cfg)))
            .await
            .with_context(|| format!("failed to connect to etcd at {}", cfg.endpoints.join(",")))?;
        tracing::info!(endpoints = ?cfg.endpoints, "Connected to etcd");
        Ok(Self { client })
    }

    /// Wrap an already connected client.
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn connect_options(cfg: &KvSourceConfig) -> ConnectOptions {
    let options = ConnectOptions::new()
        .with_connect_timeout(DIAL_TIMEOUT)
        .with_keep_alive(KEEP_ALIVE, KEEP_ALIVE);
    match &cfg.username {
        Some(user) => options.with_user(user.clone(), cfg.password.clone().unwrap_or_default()),
        None => options,
    }
}

fn into_events(response: &WatchResponse) -> anyhow::Result<Vec<KvEvent>> {
    if response.canceled() {
        anyhow::bail!("etcd cancelled the watch: {}", response.cancel_reason());
    }
    Ok(response
        .events()
        .iter()
        .filter_map(|event| {
            let kv = event.kv()?;
            let key = String::from_utf8_lossy(kv.key()).into_owned();
            Some(match event.event_type() {
                EventType::Put => KvEvent::Put {
                    key,
                    value: kv.value().to_vec(),
                },
                EventType::Delete => KvEvent::Delete { key },
            })
        })
        .collect())
}

#[async_trait]
impl KvStore for EtcdKvStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let response = self.client.clone().get(key, None).await?;
        Ok(response.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        self.client.clone().put(key, value, None).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let response = self.client.clone().delete(key, None).await?;
        Ok(response.deleted() > 0)
    }

    async fn watch(&self, key: &str) -> anyhow::Result<KvWatchStream> {
        let (watcher, responses) = self.client.clone().watch(key, None).await?;
        // The watcher owns the request side of the gRPC stream; keep it with the responses.
        let events = futures::stream::unfold((watcher, responses), |(watcher, mut responses)| async move {
            let batch = match responses.next().await? {
                Ok(response) => into_events(&response),
                Err(e) => Err(anyhow::Error::new(e).context("etcd watch stream failed")),
            };
            Some((batch, (watcher, responses)))
        });
        Ok(events.boxed())
    }
}

impl std::fmt::Debug for EtcdKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdKvStore").finish_non_exhaustive()
    }
}
