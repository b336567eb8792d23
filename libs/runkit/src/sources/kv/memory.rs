use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{KvEvent, KvStore, KvWatchStream};

const EVENT_CAPACITY: usize = 256;

/// In-process [`KvStore`], for tests and local development.
pub struct MemoryKvStore {
    entries: DashMap<String, Vec<u8>>,
    events: broadcast::Sender<KvEvent>,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: DashMap::new(),
            events,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys currently stored, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort_unstable();
        keys
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        self.entries.insert(key.to_owned(), value.clone());
        let _ = self.events.send(KvEvent::Put {
            key: key.to_owned(),
            value,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let existed = self.entries.remove(key).is_some();
        if existed {
            let _ = self.events.send(KvEvent::Delete {
                key: key.to_owned(),
            });
        }
        Ok(existed)
    }

    async fn watch(&self, key: &str) -> anyhow::Result<KvWatchStream> {
        let key = key.to_owned();
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |item| {
            let batch = match item {
                Ok(KvEvent::Put { key: ref k, .. } | KvEvent::Delete { key: ref k }) if *k != key => None,
                Ok(event) => Some(Ok(vec![event])),
                Err(e) => Some(Err(anyhow::Error::new(e).context("kv watch lagged"))),
            };
            futures::future::ready(batch)
        });
        Ok(stream.boxed())
    }
}
