//! Components run by the server binary.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use runkit::config::ChangeEvent;
use runkit::{CancellableComponent, Component, ComponentCtx, ShutdownHandle, TaskOptions};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    #[serde(rename = "Type")]
    pub kind: String,
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            kind: "memory".to_owned(),
            capacity: 1024,
        }
    }
}

/// Holds the live cache settings and follows changes to the `cache` section.
#[derive(Default)]
pub struct CacheComponent {
    current: Arc<ArcSwap<CacheSettings>>,
}

impl CacheComponent {
    pub const SECTION: &'static str = "cache";
}

#[async_trait]
impl Component for CacheComponent {
    fn name(&self) -> &str {
        "cache"
    }

    async fn start(&self, ctx: &ComponentCtx) -> anyhow::Result<()> {
        let mut settings = CacheSettings::default();
        match ctx.scan(Self::SECTION, &mut settings).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::info!(section = Self::SECTION, "Cache section absent; running with defaults");
            }
            Err(e) => return Err(e.into()),
        }
        tracing::info!(kind = %settings.kind, capacity = settings.capacity, "Cache configured");
        self.current.store(Arc::new(settings));

        let current = Arc::clone(&self.current);
        let config = ctx.config_handle();
        let tasks = ctx.tasks().clone();
        let cancel = ctx.cancellation_token().clone();
        let watched = ctx
            .watch_config(Self::SECTION, move |event| {
                let current = Arc::clone(&current);
                let config = Arc::clone(&config);
                tasks.go(
                    cancel.child_token(),
                    TaskOptions::named("cache-reload").with_ignore_fault(true),
                    move |_cancel| async move {
                        let next = match event {
                            ChangeEvent::Update => config.scan_or_default(Self::SECTION).await?,
                            ChangeEvent::Delete => CacheSettings::default(),
                        };
                        tracing::info!(?event, kind = %next.kind, capacity = next.capacity, "Cache settings reloaded");
                        current.store(Arc::new(next));
                        Ok(())
                    },
                );
            })
            .await;
        if let Err(e) = watched {
            tracing::warn!(error = %e, "Cache settings will not follow config changes");
        }
        Ok(())
    }

    async fn close_handle(&self) -> anyhow::Result<()> {
        let settings = self.current.load();
        tracing::info!(kind = %settings.kind, "Cache released");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub interval_ms: u64,
    /// Stop the whole process after this many beats.
    pub max_beats: Option<u64>,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            max_beats: None,
        }
    }
}

/// Periodic liveness log; optionally shuts the process down after `max_beats`.
pub struct Heartbeat;

impl Heartbeat {
    pub const SECTION: &'static str = "heartbeat";
}

#[async_trait]
impl CancellableComponent for Heartbeat {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn start_cancel(&self, ctx: &ComponentCtx, shutdown: ShutdownHandle) -> anyhow::Result<()> {
        let settings: HeartbeatSettings = ctx.config().scan_or_default(Self::SECTION).await?;
        if settings.interval_ms == 0 {
            anyhow::bail!("heartbeat.interval_ms must be positive");
        }

        ctx.spawn(TaskOptions::named("heartbeat"), move |cancel| async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(settings.interval_ms));
            ticker.tick().await;
            let mut beats = 0_u64;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                beats += 1;
                tracing::info!(beats, "heartbeat");
                if settings.max_beats.is_some_and(|max| beats >= max) {
                    tracing::info!(beats, "Heartbeat limit reached; requesting shutdown");
                    shutdown.shutdown();
                    break;
                }
            }
            Ok(())
        });
        Ok(())
    }
}
