use parking_lot::Mutex;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::sync::Once;

/// Original value a task panicked with.
pub type PanicPayload = Box<dyn Any + Send + 'static>;

/// A panic captured at a supervised task boundary.
///
/// Carries the task name, a readable rendering of the panic value, the backtrace
/// of the panicking frame and the original payload, so that the owner of the
/// process can re-raise it with [`std::panic::resume_unwind`].
pub struct TaskFault {
    task: String,
    message: String,
    backtrace: String,
    payload: Mutex<Option<PanicPayload>>,
}

impl TaskFault {
    pub(crate) fn capture(task: impl Into<String>, payload: PanicPayload) -> Self {
        let message = panic_message(payload.as_ref());
        let backtrace = take_panic_trace().unwrap_or_else(|| Backtrace::force_capture().to_string());
        Self {
            task: task.into(),
            message,
            backtrace,
            payload: Mutex::new(Some(payload)),
        }
    }

    #[must_use]
    pub fn task(&self) -> &str {
        &self.task
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn backtrace(&self) -> &str {
        &self.backtrace
    }

    /// Take the original panic payload. Returns `None` once it has been taken.
    #[must_use]
    pub fn take_payload(&self) -> Option<PanicPayload> {
        self.payload.lock().take()
    }
}

thread_local! {
    static ARMED: Cell<bool> = const { Cell::new(false) };
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static TRACE_HOOK: Once = Once::new();

/// Chain a panic hook that records the backtrace of panics raised while a
/// [`traced`] future is being polled. Installed once per process.
fn install_trace_hook() {
    TRACE_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if ARMED.with(Cell::get) {
                let trace = Backtrace::force_capture().to_string();
                PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            }
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Option<String> {
    PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}

/// Marks the current thread as polling a supervised task.
struct Armed {
    previous: bool,
}

impl Armed {
    fn enter() -> Self {
        PANIC_TRACE.with(|slot| slot.borrow_mut().take());
        Self {
            previous: ARMED.with(|armed| armed.replace(true)),
        }
    }
}

impl Drop for Armed {
    fn drop(&mut self) {
        ARMED.with(|armed| armed.set(self.previous));
    }
}

/// Wrap `fut` so that a panic during any of its polls leaves its backtrace for
/// the next [`TaskFault::capture`] on the same thread.
///
/// The panic unwinds into the caller's `catch_unwind` on the polling thread,
/// which is where the trace is picked up.
pub(crate) fn traced<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    install_trace_hook();
    let mut fut = Box::pin(fut);
    std::future::poll_fn(move |cx| {
        let _armed = Armed::enter();
        fut.as_mut().poll(cx)
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

impl fmt::Debug for TaskFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFault")
            .field("task", &self.task)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for TaskFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task '{}' panicked: {}", self.task, self.message)
    }
}

impl std::error::Error for TaskFault {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn message_from_static_str() {
        let fault = TaskFault::capture("t", Box::new("boom"));
        assert_eq!(fault.message(), "boom");
        assert_eq!(fault.to_string(), "task 't' panicked: boom");
    }

    #[test]
    fn message_from_string_and_payload_taken_once() {
        let fault = TaskFault::capture("t", Box::new(String::from("formatted 42")));
        assert_eq!(fault.message(), "formatted 42");
        assert!(fault.take_payload().is_some());
        assert!(fault.take_payload().is_none());
    }

    #[test]
    fn message_from_opaque_payload() {
        let fault = TaskFault::capture("t", Box::new(7_u32));
        assert_eq!(fault.message(), "non-string panic payload");
    }

    #[inline(never)]
    fn panic_inside_marked_frame() {
        panic!("marked")
    }

    #[tokio::test]
    async fn traced_panic_keeps_the_panicking_frame() {
        use futures::FutureExt;
        use std::panic::AssertUnwindSafe;

        let payload = AssertUnwindSafe(traced(async { panic_inside_marked_frame() }))
            .catch_unwind()
            .await
            .unwrap_err();
        let fault = TaskFault::capture("t", payload);

        assert_eq!(fault.message(), "marked");
        assert!(
            fault.backtrace().contains("panic_inside_marked_frame"),
            "backtrace lacks panic site:\n{}",
            fault.backtrace()
        );
        assert!(take_panic_trace().is_none());
    }

    #[test]
    fn panics_outside_traced_futures_are_not_recorded() {
        install_trace_hook();
        let result = std::panic::catch_unwind(panic_inside_marked_frame);
        assert!(result.is_err());
        assert!(take_panic_trace().is_none());
    }
}
