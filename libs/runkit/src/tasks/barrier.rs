use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Process-wide join counter: `wait` resolves once every entered guard is dropped.
#[derive(Debug, Default)]
pub(crate) struct JoinBarrier {
    active: AtomicUsize,
    idle: Notify,
}

impl JoinBarrier {
    pub(crate) fn enter(self: &Arc<Self>) -> BarrierGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        BarrierGuard {
            barrier: Arc::clone(self),
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register interest before reading the counter so a concurrent
            // release cannot slip between the check and the await.
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Decrements the owning barrier when dropped.
#[derive(Debug)]
pub(crate) struct BarrierGuard {
    barrier: Arc<JoinBarrier>,
}

impl Drop for BarrierGuard {
    fn drop(&mut self) {
        if self.barrier.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.barrier.idle.notify_waiters();
        }
    }
}
