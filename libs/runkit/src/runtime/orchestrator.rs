//! Lifecycle orchestrator - drives registered components through start and stop.
//!
//! Phase order: **start (registration order) → wait → stop (reverse order) → join**.
//!
//! - A start failure stops the phase immediately: the root token is cancelled,
//!   components that already started are closed in reverse order, supervised
//!   tasks are joined and the failure is returned. The failing component and
//!   everything after it are never closed.
//! - Shutdown can be driven by OS signals, an external `CancellationToken`,
//!   an arbitrary future, a [`ShutdownHandle`], or an escalated task fault.
//! - Close failures are logged and never abort shutdown.
//! - There is no shutdown timeout: a task that ignores cancellation delays the
//!   join indefinitely.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::signals::SignalListener;
use crate::config::Config;
use crate::context::{ComponentCtx, ContextBuilder};
use crate::contracts::{CancellableComponent, Component, ShutdownHandle};
use crate::error::RuntimeError;
use crate::tasks::TaskLauncher;

/// How the orchestrator should decide when to stop.
pub enum ShutdownOptions {
    /// Listen for OS signals (Ctrl+C / SIGTERM).
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, we initiate shutdown.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

/// Observable orchestrator state.
///
/// `Starting → ShuttingDown` is the rollback path taken on a start failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

enum Registration {
    Plain(Arc<dyn Component>),
    Cancellable(Arc<dyn CancellableComponent>),
}

impl Registration {
    fn name(&self) -> &str {
        match self {
            Self::Plain(c) => c.name(),
            Self::Cancellable(c) => c.name(),
        }
    }

    async fn start(&self, ctx: &ComponentCtx, shutdown: &ShutdownHandle) -> anyhow::Result<()> {
        match self {
            Self::Plain(c) => c.start(ctx).await,
            Self::Cancellable(c) => c.start_cancel(ctx, shutdown.clone()).await,
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        match self {
            Self::Plain(c) => c.close_handle().await,
            Self::Cancellable(c) => c.close_handle().await,
        }
    }
}

/// Owns the registration list and the process-wide runtime objects
/// (root cancellation token, task launcher, configuration).
pub struct Orchestrator {
    config: Arc<Config>,
    registrations: Vec<Registration>,
    shutdown: Mutex<Option<ShutdownOptions>>,
    root: CancellationToken,
    tasks: TaskLauncher,
    state: watch::Sender<LifecycleState>,
}

impl Orchestrator {
    /// Create an orchestrator. No component is started until [`Orchestrator::run`].
    #[must_use]
    pub fn new(config: Arc<Config>, shutdown: ShutdownOptions) -> Self {
        let root = match &shutdown {
            ShutdownOptions::Token(t) => t.clone(),
            ShutdownOptions::Signals | ShutdownOptions::Future(_) => CancellationToken::new(),
        };
        let (state, _) = watch::channel(LifecycleState::Created);

        Self {
            config,
            registrations: Vec::new(),
            shutdown: Mutex::new(Some(shutdown)),
            tasks: TaskLauncher::new(root.clone()),
            root,
            state,
        }
    }

    /// Append a plain component. Registration order is start order.
    #[must_use]
    pub fn register(mut self, component: impl Component + 'static) -> Self {
        self.registrations
            .push(Registration::Plain(Arc::new(component)));
        self
    }

    /// Append a component that receives a [`ShutdownHandle`].
    #[must_use]
    pub fn register_cancel(mut self, component: impl CancellableComponent + 'static) -> Self {
        self.registrations
            .push(Registration::Cancellable(Arc::new(component)));
        self
    }

    /// Number of registered components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Handle that stops a running orchestrator from the outside.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.root.clone())
    }

    /// The process task launcher shared with every component.
    #[must_use]
    pub fn tasks(&self) -> &TaskLauncher {
        &self.tasks
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Run the full lifecycle: start → wait → stop → join.
    ///
    /// # Errors
    /// - [`RuntimeError::Start`] if a component fails to start (after rollback);
    /// - [`RuntimeError::TaskFault`] if a supervised task escalated a panic
    ///   (after a complete shutdown).
    pub async fn run(self) -> Result<(), RuntimeError> {
        let waiter = self.spawn_shutdown_waiter();
        let result = self.run_phases().await;
        if let Some(waiter) = waiter {
            waiter.abort();
        }
        result
    }

    async fn run_phases(&self) -> Result<(), RuntimeError> {
        let started = self.run_start_phase().await?;

        self.set_state(LifecycleState::Running);
        tracing::info!(components = started, "All components started; waiting for shutdown");

        // WAIT
        self.root.cancelled().await;

        self.set_state(LifecycleState::ShuttingDown);
        self.run_stop_phase(&self.registrations).await;
        self.join_tasks().await;
        self.set_state(LifecycleState::Stopped);

        if let Some(fault) = self.tasks.take_fault() {
            tracing::error!(task = fault.task(), "Runtime stopped because of an escalated task fault");
            return Err(RuntimeError::TaskFault(fault));
        }

        tracing::info!("Runtime stopped");
        Ok(())
    }

    /// START phase: start components one at a time, in registration order.
    async fn run_start_phase(&self) -> Result<usize, RuntimeError> {
        tracing::info!("Phase: start");
        self.set_state(LifecycleState::Starting);

        let ctx_builder = ContextBuilder::new(
            Arc::clone(&self.config),
            self.tasks.clone(),
            self.root.clone(),
        );
        let trigger = ShutdownHandle::new(self.root.clone());

        for (idx, reg) in self.registrations.iter().enumerate() {
            let ctx = ctx_builder.for_component(reg.name());
            tracing::debug!(component = reg.name(), "Starting component");

            if let Err(source) = reg.start(&ctx, &trigger).await {
                tracing::error!(
                    component = reg.name(),
                    error = %source,
                    "Component failed to start; rolling back"
                );
                self.set_state(LifecycleState::ShuttingDown);
                self.root.cancel();
                self.run_stop_phase(&self.registrations[..idx]).await;
                self.join_tasks().await;
                self.set_state(LifecycleState::Stopped);
                return Err(RuntimeError::Start {
                    component: reg.name().to_owned(),
                    source,
                });
            }

            tracing::info!(component = reg.name(), "Started component");
        }

        Ok(self.registrations.len())
    }

    /// STOP phase: close the given components in reverse order.
    async fn run_stop_phase(&self, started: &[Registration]) {
        tracing::info!("Phase: stop");
        for reg in started.iter().rev() {
            Self::close_one(reg).await;
        }
    }

    /// Close a single component, logging errors but continuing execution.
    async fn close_one(reg: &Registration) {
        if let Err(err) = reg.close().await {
            tracing::warn!(component = reg.name(), error = %err, "Failed to close component");
        } else {
            tracing::info!(component = reg.name(), "Closed component");
        }
    }

    async fn join_tasks(&self) {
        let active = self.tasks.active();
        if active > 0 {
            tracing::debug!(active, "Waiting for supervised tasks to finish");
        }
        self.tasks.wait().await;
    }

    fn set_state(&self, next: LifecycleState) {
        let prev = self.state.send_replace(next);
        tracing::debug!(from = ?prev, to = ?next, "Lifecycle transition");
    }

    /// Spawn the task that cancels the root token when the chosen trigger fires.
    fn spawn_shutdown_waiter(&self) -> Option<JoinHandle<()>> {
        let root = self.root.clone();
        let options = self.shutdown.lock().take()?;
        match options {
            ShutdownOptions::Signals => {
                let listener = SignalListener::install()
                    .inspect_err(|e| tracing::warn!(error = %e, "Cannot install signal handlers; falling back to Ctrl+C"))
                    .ok();
                Some(tokio::spawn(async move {
                    match listener {
                        Some(mut listener) => {
                            let signal = listener.recv().await;
                            tracing::info!(%signal, "Termination signal received; stopping runtime");
                        }
                        None => {
                            if tokio::signal::ctrl_c().await.is_err() {
                                return;
                            }
                            tracing::info!("Ctrl+C received; stopping runtime");
                        }
                    }
                    root.cancel();
                }))
            }
            ShutdownOptions::Future(trigger) => Some(tokio::spawn(async move {
                trigger.await;
                tracing::info!("Shutdown future resolved; stopping runtime");
                root.cancel();
            })),
            ShutdownOptions::Token(_) => {
                tracing::debug!("Lifecycle bound to the caller's cancellation token");
                None
            }
        }
    }
}
