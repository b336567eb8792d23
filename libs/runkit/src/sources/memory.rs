use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;

use crate::config::{ChangeEvent, Source, SourceError, WatchCallback};
use crate::tasks::{TaskLauncher, TaskOptions};

const CHANGE_CAPACITY: usize = 64;

/// In-process, non-persistent source.
///
/// Missing sections are reported as not found and never written back.
pub struct MemorySource {
    sections: DashMap<String, Value>,
    changes: broadcast::Sender<(String, ChangeEvent)>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub const NAME: &'static str = "memory";

    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            sections: DashMap::new(),
            changes,
        }
    }

    /// Seed a section, builder style.
    #[must_use]
    pub fn with(self, key: impl Into<String>, value: Value) -> Self {
        self.sections.insert(key.into(), value);
        self
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.sections.insert(key.clone(), value);
        let _ = self.changes.send((key, ChangeEvent::Update));
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let removed = self.sections.remove(key).map(|(_, v)| v);
        if removed.is_some() {
            let _ = self.changes.send((key.to_owned(), ChangeEvent::Delete));
        }
        removed
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.sections.get(key).map(|v| v.value().clone())
    }
}

#[async_trait]
impl Source for MemorySource {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn scan(&self, key: &str, target: &mut Value) -> Result<(), SourceError> {
        let value = self.get(key).ok_or_else(|| SourceError::NotFound {
            key: key.to_owned(),
        })?;
        *target = value;
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, SourceError> {
        Ok(self.sections.contains_key(key))
    }

    async fn watch(
        &self,
        tasks: &TaskLauncher,
        cancel: CancellationToken,
        key: &str,
        callback: WatchCallback,
    ) -> Result<(), SourceError> {
        let mut stream = BroadcastStream::new(self.changes.subscribe());
        let key = key.to_owned();
        tasks.go(
            cancel,
            TaskOptions::named(format!("watch:memory:{key}")),
            move |cancel| async move {
                loop {
                    let next = tokio::select! {
                        () = cancel.cancelled() => break,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok((changed, event))) if changed == key => callback(event),
                        Some(Ok(_)) => {}
                        Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                            tracing::warn!(key = %key, skipped, "Memory source watcher lagged");
                        }
                        None => break,
                    }
                }
                Ok(())
            },
        );
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn scan_missing_leaves_target_and_store_untouched() {
        let source = MemorySource::new();
        let mut target = json!({"Type": "memory"});
        let err = source.scan("cache", &mut target).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(target, json!({"Type": "memory"}));
        assert!(!source.has("cache").await.unwrap());
    }

    #[tokio::test]
    async fn watch_reports_changes_for_its_key_only() {
        let source = MemorySource::new().with("cache", json!({"Type": "memory"}));
        let root = CancellationToken::new();
        let tasks = TaskLauncher::new(root.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        source
            .watch(
                &tasks,
                root.child_token(),
                "cache",
                Arc::new(move |event| {
                    let _ = tx.send(event);
                }),
            )
            .await
            .unwrap();

        source.set("other", json!(1));
        source.set("cache", json!({"Type": "redis"}));
        source.remove("cache");
        assert!(source.remove("cache").is_none());

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first, Some(ChangeEvent::Update));
        assert_eq!(second, Some(ChangeEvent::Delete));

        root.cancel();
        tasks.wait().await;
        assert!(rx.try_recv().is_err());
    }
}
