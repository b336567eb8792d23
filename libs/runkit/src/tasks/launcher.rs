//! Supervised task launcher.
//!
//! Every task launched through [`TaskLauncher::go`] is tracked by a single
//! process-wide join barrier and runs behind a panic boundary:
//!
//! - `Ok(())` completes silently;
//! - `Err(e)` is logged at warn level and reported as [`TaskExit::Errored`];
//! - a panic is captured into a [`TaskFault`], logged at error level with the
//!   backtrace of the panicking frame, and then either contained
//!   (`ignore_fault = true`) or escalated.
//!
//! Escalation records the fault as the process fault (the first one wins) and
//! cancels the root token, which drives the orchestrator into shutdown. The
//! orchestrator reports the recorded fault once shutdown completes.

use futures::FutureExt;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::barrier::JoinBarrier;
use super::fault::{traced, TaskFault};

/// Per-task launch options.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    name: Option<Cow<'static, str>>,
    ignore_fault: bool,
}

impl TaskOptions {
    /// Options for a task with a diagnostic name.
    #[must_use]
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: Some(name.into()),
            ignore_fault: false,
        }
    }

    /// Contain panics of this task instead of escalating them.
    #[must_use]
    pub fn with_ignore_fault(mut self, ignore: bool) -> Self {
        self.ignore_fault = ignore;
        self
    }

    #[must_use]
    pub fn ignore_fault(&self) -> bool {
        self.ignore_fault
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("anonymous")
    }
}

/// How a supervised task ended.
#[derive(Debug)]
pub enum TaskExit {
    Completed,
    Errored(anyhow::Error),
    Faulted(Arc<TaskFault>),
}

impl TaskExit {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    #[must_use]
    pub fn fault(&self) -> Option<&Arc<TaskFault>> {
        match self {
            Self::Faulted(fault) => Some(fault),
            Self::Completed | Self::Errored(_) => None,
        }
    }
}

struct Inner {
    barrier: Arc<JoinBarrier>,
    root: CancellationToken,
    escalated: Mutex<Option<Arc<TaskFault>>>,
}

/// Launches supervised background tasks and owns the process join barrier.
///
/// Cloning is cheap; all clones share the same barrier and escalation slot.
#[derive(Clone)]
pub struct TaskLauncher {
    inner: Arc<Inner>,
}

impl TaskLauncher {
    /// Create a launcher whose escalated faults cancel `root`.
    #[must_use]
    pub fn new(root: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                barrier: Arc::new(JoinBarrier::default()),
                root,
                escalated: Mutex::new(None),
            }),
        }
    }

    /// Launch `f` as an independent task. Does not block.
    ///
    /// `cancel` is handed to `f`; the task is expected to observe it.
    /// Must be called from within a Tokio runtime.
    pub fn go<F, Fut>(&self, cancel: CancellationToken, options: TaskOptions, f: F) -> JoinHandle<TaskExit>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let guard = self.inner.barrier.enter();
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(traced(async move { f(cancel).await }))
                .catch_unwind()
                .await;

            let exit = match outcome {
                Ok(Ok(())) => {
                    tracing::debug!(task = options.name(), "Supervised task completed");
                    TaskExit::Completed
                }
                Ok(Err(err)) => {
                    tracing::warn!(task = options.name(), error = %err, "Supervised task returned an error");
                    TaskExit::Errored(err)
                }
                Err(payload) => {
                    let fault = Arc::new(TaskFault::capture(options.name().to_owned(), payload));
                    tracing::error!(
                        task = fault.task(),
                        panic = fault.message(),
                        ignore_fault = options.ignore_fault(),
                        backtrace = %fault.backtrace(),
                        "Supervised task panicked"
                    );
                    if !options.ignore_fault() {
                        inner.record(&fault);
                    }
                    TaskExit::Faulted(fault)
                }
            };

            drop(guard);

            if exit.fault().is_some() && !options.ignore_fault() {
                tracing::error!(task = options.name(), "Escalating task fault: triggering process shutdown");
                inner.root.cancel();
            }

            exit
        })
    }

    /// Resolve once every task launched through this launcher has finished.
    pub async fn wait(&self) {
        self.inner.barrier.wait().await;
    }

    /// Number of tasks currently running.
    #[must_use]
    pub fn active(&self) -> usize {
        self.inner.barrier.active()
    }

    /// Take the first escalated fault, if any.
    #[must_use]
    pub fn take_fault(&self) -> Option<Arc<TaskFault>> {
        self.inner.escalated.lock().take()
    }
}

impl Inner {
    fn record(&self, fault: &Arc<TaskFault>) {
        let mut slot = self.escalated.lock();
        if slot.is_none() {
            *slot = Some(Arc::clone(fault));
        }
    }
}

impl std::fmt::Debug for TaskLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLauncher")
            .field("active", &self.active())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing_test::traced_test;

    async fn explode(msg: &'static str) -> anyhow::Result<()> {
        panic!("{msg}")
    }

    #[tokio::test]
    async fn go_does_not_block_and_wait_joins_everything() {
        let root = CancellationToken::new();
        let launcher = TaskLauncher::new(root.clone());
        let done = Arc::new(AtomicUsize::new(0));

        for i in 0..5_u64 {
            let done = done.clone();
            launcher.go(root.child_token(), TaskOptions::named("sleeper"), move |_| async move {
                tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(launcher.active(), 5);

        tokio::time::timeout(Duration::from_secs(2), launcher.wait())
            .await
            .unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(launcher.active(), 0);
    }

    #[tokio::test]
    async fn errored_task_is_reported_but_not_escalated() {
        let root = CancellationToken::new();
        let launcher = TaskLauncher::new(root.clone());

        let exit = launcher
            .go(root.child_token(), TaskOptions::default(), |_| async {
                Err(anyhow::anyhow!("nope"))
            })
            .await
            .unwrap();

        assert!(matches!(exit, TaskExit::Errored(_)));
        assert!(!root.is_cancelled());
        assert!(launcher.take_fault().is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn contained_fault_is_logged_and_does_not_cancel_root() {
        let root = CancellationToken::new();
        let launcher = TaskLauncher::new(root.clone());

        let exit = launcher
            .go(
                root.child_token(),
                TaskOptions::named("contained").with_ignore_fault(true),
                |_| explode("contained boom"),
            )
            .await
            .unwrap();

        let fault = exit.fault().unwrap();
        assert_eq!(fault.task(), "contained");
        assert_eq!(fault.message(), "contained boom");
        assert!(!root.is_cancelled());
        assert!(launcher.take_fault().is_none());
        assert_eq!(launcher.active(), 0);
        assert!(logs_contain("Supervised task panicked"));
    }

    #[tokio::test]
    #[traced_test]
    async fn uncontained_fault_is_escalated_after_barrier_release() {
        let root = CancellationToken::new();
        let launcher = TaskLauncher::new(root.clone());

        let handle = launcher.go(root.child_token(), TaskOptions::named("failfast"), |_| explode("fatal boom"));

        tokio::time::timeout(Duration::from_secs(1), root.cancelled())
            .await
            .unwrap();
        assert_eq!(launcher.active(), 0);

        let exit = handle.await.unwrap();
        assert!(exit.fault().is_some());

        let fault = launcher.take_fault().unwrap();
        assert_eq!(fault.message(), "fatal boom");
        assert!(fault.take_payload().is_some());
        assert!(logs_contain("Escalating task fault"));
    }

    #[tokio::test]
    async fn first_escalated_fault_wins() {
        let root = CancellationToken::new();
        let launcher = TaskLauncher::new(root.clone());

        launcher
            .go(root.child_token(), TaskOptions::named("first"), |_| explode("first"))
            .await
            .unwrap();
        launcher
            .go(root.child_token(), TaskOptions::named("second"), |_| explode("second"))
            .await
            .unwrap();

        assert_eq!(launcher.take_fault().unwrap().task(), "first");
    }

    #[inline(never)]
    fn fail_deep_in_worker() -> anyhow::Result<()> {
        panic!("deep boom")
    }

    #[tokio::test]
    async fn fault_backtrace_names_the_panicking_function() {
        let root = CancellationToken::new();
        let launcher = TaskLauncher::new(root.clone());

        let exit = launcher
            .go(
                root.child_token(),
                TaskOptions::named("deep").with_ignore_fault(true),
                |_| async { fail_deep_in_worker() },
            )
            .await
            .unwrap();

        let fault = exit.fault().unwrap();
        assert!(
            fault.backtrace().contains("fail_deep_in_worker"),
            "backtrace lacks panic site:\n{}",
            fault.backtrace()
        );
    }

    #[tokio::test]
    async fn wait_joins_finishing_and_contained_faulting_tasks_alike() {
        const TASKS: usize = 8;
        let root = CancellationToken::new();
        let launcher = TaskLauncher::new(root.clone());
        let finished = Arc::new(AtomicUsize::new(0));

        for i in 0..TASKS {
            let finished = finished.clone();
            let delay = Duration::from_millis(5) * u32::try_from(TASKS - i).unwrap();
            launcher.go(
                root.child_token(),
                TaskOptions::named(format!("mixed-{i}")).with_ignore_fault(true),
                move |_| async move {
                    tokio::time::sleep(delay).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    if i % 3 == 0 {
                        panic!("mixed task {i} failed");
                    }
                    Ok(())
                },
            );
        }
        assert_eq!(launcher.active(), TASKS);

        tokio::time::timeout(Duration::from_secs(2), launcher.wait())
            .await
            .unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), TASKS);
        assert_eq!(launcher.active(), 0);
        assert!(!root.is_cancelled());
        assert!(launcher.take_fault().is_none());
    }

    #[tokio::test]
    async fn task_observes_cancellation() {
        let root = CancellationToken::new();
        let launcher = TaskLauncher::new(root.clone());

        launcher.go(root.child_token(), TaskOptions::named("loop"), |cancel| async move {
            cancel.cancelled().await;
            Ok(())
        });

        root.cancel();
        tokio::time::timeout(Duration::from_secs(1), launcher.wait())
            .await
            .unwrap();
    }
}
