use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::context::ComponentCtx;

/// Plain component: started in registration order, closed in reverse order.
///
/// `start` must return once the component is ready; long-running work belongs in
/// supervised tasks launched through [`ComponentCtx::spawn`].
#[async_trait]
pub trait Component: Send + Sync {
    /// Name used in logs and startup errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn start(&self, ctx: &ComponentCtx) -> anyhow::Result<()>;

    /// Release resources. Called at most once, and only after a successful `start`.
    /// Errors are logged by the orchestrator and never abort shutdown.
    async fn close_handle(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Component that may itself trigger process-wide shutdown, e.g. a server whose
/// listener died.
#[async_trait]
pub trait CancellableComponent: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn start_cancel(&self, ctx: &ComponentCtx, shutdown: ShutdownHandle) -> anyhow::Result<()>;

    async fn close_handle(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Triggers process-wide shutdown. Triggering more than once is a no-op.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("shutdown: requested via shutdown handle");
        }
        self.token.cancel();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Component backed by an async closure; has nothing to close.
pub struct FnComponent<F> {
    name: &'static str,
    f: F,
}

/// Wrap an async closure as a [`Component`].
///
/// ```ignore
/// orchestrator.register(component_fn("migrations", |ctx| async move {
///     let cfg: DbConfig = ctx.config().scan_or_default("db").await?;
///     run_migrations(&cfg).await
/// }))
/// ```
pub fn component_fn<F, Fut>(name: &'static str, f: F) -> FnComponent<F>
where
    F: Fn(ComponentCtx) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnComponent { name, f }
}

#[async_trait]
impl<F, Fut> Component for FnComponent<F>
where
    F: Fn(ComponentCtx) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn name(&self) -> &str {
        self.name
    }

    async fn start(&self, ctx: &ComponentCtx) -> anyhow::Result<()> {
        (self.f)(ctx.clone()).await
    }
}
