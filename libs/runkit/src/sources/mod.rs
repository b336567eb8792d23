//! Built-in source backends.

mod file;
pub mod kv;
mod memory;

pub use file::FileSource;
pub use kv::{KvEvent, KvSource, KvSourceConfig, KvStore, MemoryKvStore, REMOTE_OP_TIMEOUT};
pub use memory::MemorySource;

#[cfg(feature = "etcd")]
pub use kv::EtcdKvStore;
