//! Remote key-value store backend.
//!
//! [`KvStore`] is the minimal client contract a distributed store must offer;
//! [`KvSource`] layers namespacing, serialization, timeouts and
//! fallback-initialization on top of it. [`MemoryKvStore`] is always built;
//! the etcd v3 client ships behind the `etcd` feature.

#[cfg(feature = "etcd")]
mod etcd;
mod memory;
mod source;

#[cfg(feature = "etcd")]
pub use etcd::EtcdKvStore;
pub use memory::MemoryKvStore;
pub use source::{KvSource, KvSourceConfig, REMOTE_OP_TIMEOUT};

use async_trait::async_trait;
use futures::stream::BoxStream;

/// A change observed on a watched key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvEvent {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Stream of change batches. An `Err` item ends the watch.
pub type KvWatchStream = BoxStream<'static, anyhow::Result<Vec<KvEvent>>>;

/// Client of a distributed key-value store.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;

    /// Subscribe to changes of exactly `key`. Changes made after this call
    /// returns are delivered.
    async fn watch(&self, key: &str) -> anyhow::Result<KvWatchStream>;
}
