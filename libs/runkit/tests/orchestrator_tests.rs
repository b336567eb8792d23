#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Lifecycle tests for the orchestrator: ordering, rollback, component-driven
//! shutdown and task fault escalation.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use runkit::{
    CancellableComponent, Component, ComponentCtx, Config, LifecycleState, Orchestrator,
    RuntimeError, ShutdownHandle, ShutdownOptions, TaskOptions,
};

type Journal = Arc<Mutex<Vec<String>>>;

fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().clone()
}

fn empty_config() -> Arc<Config> {
    Arc::new(Config::builder("orchestrator-tests").build())
}

/// Records start/close calls; optionally fails either step.
struct Recorder {
    name: &'static str,
    journal: Journal,
    fail_start: bool,
    fail_close: bool,
}

impl Recorder {
    fn new(name: &'static str, journal: &Journal) -> Self {
        Self {
            name,
            journal: journal.clone(),
            fail_start: false,
            fail_close: false,
        }
    }

    fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

#[async_trait::async_trait]
impl Component for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    async fn start(&self, _ctx: &ComponentCtx) -> anyhow::Result<()> {
        self.journal.lock().push(format!("start:{}", self.name));
        if self.fail_start {
            anyhow::bail!("{} refused to start", self.name);
        }
        Ok(())
    }

    async fn close_handle(&self) -> anyhow::Result<()> {
        self.journal.lock().push(format!("close:{}", self.name));
        if self.fail_close {
            anyhow::bail!("{} failed to close", self.name);
        }
        Ok(())
    }
}

#[tokio::test]
async fn components_close_in_reverse_start_order() {
    let log = journal();
    let cancel = CancellationToken::new();
    let orch = Orchestrator::new(empty_config(), ShutdownOptions::Token(cancel.clone()))
        .register(Recorder::new("a", &log))
        .register(Recorder::new("b", &log))
        .register(Recorder::new("c", &log));
    let mut states = orch.subscribe_state();

    let run = tokio::spawn(orch.run());
    states
        .wait_for(|s| *s == LifecycleState::Running)
        .await
        .unwrap();
    cancel.cancel();

    timeout(Duration::from_secs(5), run)
        .await
        .expect("runtime did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(
        entries(&log),
        ["start:a", "start:b", "start:c", "close:c", "close:b", "close:a"]
    );
}

type StateSlot = Arc<Mutex<Option<watch::Receiver<LifecycleState>>>>;

/// Journals the lifecycle state current at its own start and close.
struct StateWitness {
    states: StateSlot,
    journal: Journal,
}

impl StateWitness {
    fn record(&self, step: &str) {
        let state = self.states.lock().as_ref().map(|rx| *rx.borrow());
        self.journal.lock().push(format!("{step}:{state:?}"));
    }
}

#[async_trait::async_trait]
impl Component for StateWitness {
    fn name(&self) -> &str {
        "witness"
    }

    async fn start(&self, _ctx: &ComponentCtx) -> anyhow::Result<()> {
        self.record("witness-start");
        Ok(())
    }

    async fn close_handle(&self) -> anyhow::Result<()> {
        self.record("witness-close");
        Ok(())
    }
}

#[tokio::test]
async fn start_failure_rolls_back_started_components_only() {
    let log = journal();
    let slot: StateSlot = Arc::new(Mutex::new(None));
    let orch = Orchestrator::new(
        empty_config(),
        ShutdownOptions::Token(CancellationToken::new()),
    )
    .register(StateWitness {
        states: slot.clone(),
        journal: log.clone(),
    })
    .register(Recorder::new("a", &log))
    .register(Recorder::new("b", &log).failing_start())
    .register(Recorder::new("c", &log));
    *slot.lock() = Some(orch.subscribe_state());
    let mut states = orch.subscribe_state();

    let err = timeout(Duration::from_secs(5), orch.run())
        .await
        .expect("rollback hung")
        .unwrap_err();

    assert!(matches!(err, RuntimeError::Start { .. }));
    assert_eq!(err.component(), Some("b"));
    assert_eq!(
        entries(&log),
        [
            "witness-start:Some(Starting)",
            "start:a",
            "start:b",
            "close:a",
            "witness-close:Some(ShuttingDown)",
        ]
    );
    assert_eq!(*states.borrow_and_update(), LifecycleState::Stopped);
}

#[tokio::test]
async fn close_failures_do_not_stop_shutdown() {
    let log = journal();
    let cancel = CancellationToken::new();
    let orch = Orchestrator::new(empty_config(), ShutdownOptions::Token(cancel.clone()))
        .register(Recorder::new("a", &log))
        .register(Recorder::new("b", &log).failing_close());

    cancel.cancel();
    timeout(Duration::from_secs(5), orch.run())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entries(&log), ["start:a", "start:b", "close:b", "close:a"]);
}

/// Shuts the process down from inside a supervised task once started.
struct SelfStopping {
    journal: Journal,
}

#[async_trait::async_trait]
impl CancellableComponent for SelfStopping {
    fn name(&self) -> &str {
        "self-stopping"
    }

    async fn start_cancel(&self, ctx: &ComponentCtx, shutdown: ShutdownHandle) -> anyhow::Result<()> {
        self.journal.lock().push("start:self-stopping".to_owned());
        ctx.spawn(TaskOptions::named("stopper"), move |_cancel| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            shutdown.shutdown();
            shutdown.shutdown();
            Ok(())
        });
        Ok(())
    }

    async fn close_handle(&self) -> anyhow::Result<()> {
        self.journal.lock().push("close:self-stopping".to_owned());
        Ok(())
    }
}

#[tokio::test]
async fn cancellable_component_triggers_shutdown() {
    let log = journal();
    let orch = Orchestrator::new(
        empty_config(),
        ShutdownOptions::Token(CancellationToken::new()),
    )
    .register(Recorder::new("a", &log))
    .register_cancel(SelfStopping {
        journal: log.clone(),
    });

    timeout(Duration::from_secs(5), orch.run())
        .await
        .expect("component-driven shutdown did not happen")
        .unwrap();
    assert_eq!(
        entries(&log),
        [
            "start:a",
            "start:self-stopping",
            "close:self-stopping",
            "close:a"
        ]
    );
}

#[tokio::test]
async fn external_shutdown_handle_stops_run() {
    let orch = Orchestrator::new(
        empty_config(),
        ShutdownOptions::Token(CancellationToken::new()),
    );
    let handle = orch.shutdown_handle();
    let run = tokio::spawn(orch.run());

    handle.shutdown();
    assert!(handle.is_shutting_down());
    timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

/// Starts a background task that panics.
struct Faulty {
    ignore_fault: bool,
}

async fn explode(msg: &'static str) -> anyhow::Result<()> {
    tokio::time::sleep(Duration::from_millis(10)).await;
    panic!("{msg}");
}

#[async_trait::async_trait]
impl Component for Faulty {
    fn name(&self) -> &str {
        "faulty"
    }

    async fn start(&self, ctx: &ComponentCtx) -> anyhow::Result<()> {
        let options = TaskOptions::named("doomed").with_ignore_fault(self.ignore_fault);
        ctx.spawn(options, |_cancel| explode("disk on fire"));
        Ok(())
    }
}

#[tokio::test]
async fn escalated_task_fault_stops_runtime_and_is_returned() {
    let log = journal();
    let orch = Orchestrator::new(
        empty_config(),
        ShutdownOptions::Token(CancellationToken::new()),
    )
    .register(Recorder::new("a", &log))
    .register(Faulty {
        ignore_fault: false,
    });

    let err = timeout(Duration::from_secs(5), orch.run())
        .await
        .expect("fault did not stop the runtime")
        .unwrap_err();

    let fault = match err {
        RuntimeError::TaskFault(fault) => fault,
        other => panic!("expected a task fault, got {other:?}"),
    };
    assert_eq!(fault.task(), "doomed");
    assert!(fault.message().contains("disk on fire"));
    let payload = fault.take_payload().expect("payload available once");
    assert_eq!(payload.downcast_ref::<String>().map(String::as_str), Some("disk on fire"));
    assert!(fault.take_payload().is_none());
    assert_eq!(entries(&log), ["start:a", "close:a"]);
}

#[tokio::test]
async fn contained_task_fault_keeps_runtime_running() {
    let cancel = CancellationToken::new();
    let orch = Orchestrator::new(empty_config(), ShutdownOptions::Token(cancel.clone()))
        .register(Faulty { ignore_fault: true });
    let tasks = orch.tasks().clone();
    let mut states = orch.subscribe_state();
    let run = tokio::spawn(orch.run());

    states
        .wait_for(|s| *s == LifecycleState::Running)
        .await
        .unwrap();
    timeout(Duration::from_secs(5), async {
        while tasks.active() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("faulty task never finished");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!run.is_finished(), "contained fault must not stop the runtime");
    assert!(tasks.take_fault().is_none());

    cancel.cancel();
    timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn sigterm_stops_runtime_under_signal_shutdown() {
    let log = journal();
    let orch = Orchestrator::new(empty_config(), ShutdownOptions::Signals)
        .register(Recorder::new("a", &log));
    let mut states = orch.subscribe_state();

    let run = tokio::spawn(orch.run());
    states
        .wait_for(|s| *s == LifecycleState::Running)
        .await
        .unwrap();

    let status = std::process::Command::new("kill")
        .args(["-TERM", &std::process::id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    timeout(Duration::from_secs(5), run)
        .await
        .expect("runtime ignored SIGTERM")
        .unwrap()
        .unwrap();
    assert_eq!(entries(&log), ["start:a", "close:a"]);
}
