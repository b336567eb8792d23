//! OS termination signals that stop the runtime under [`ShutdownOptions::Signals`].
//!
//! [`ShutdownOptions::Signals`]: super::ShutdownOptions::Signals

use std::fmt;
use std::io;

/// The signal that ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    Interrupt,
    Terminate,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
        })
    }
}

/// Handlers for SIGINT and SIGTERM, registered when the listener is built.
///
/// Registering up front means a signal delivered between `run` and the first
/// poll of [`SignalListener::recv`] is still observed.
#[cfg(unix)]
pub(crate) struct SignalListener {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalListener {
    pub(crate) fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next termination signal.
    pub(crate) async fn recv(&mut self) -> Termination {
        tokio::select! {
            _ = self.interrupt.recv() => Termination::Interrupt,
            _ = self.terminate.recv() => Termination::Terminate,
        }
    }
}

#[cfg(not(unix))]
pub(crate) struct SignalListener;

#[cfg(not(unix))]
impl SignalListener {
    pub(crate) fn install() -> io::Result<Self> {
        Ok(Self)
    }

    pub(crate) async fn recv(&mut self) -> Termination {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Termination::Interrupt,
            Err(e) => {
                tracing::warn!(error = %e, "Ctrl+C handler unavailable; only programmatic shutdown remains");
                std::future::pending().await
            }
        }
    }
}

#[cfg(all(test, unix))]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn termination_names_the_signal() {
        assert_eq!(Termination::Interrupt.to_string(), "SIGINT");
        assert_eq!(Termination::Terminate.to_string(), "SIGTERM");
    }

    #[tokio::test]
    async fn listener_reports_sigterm() {
        let mut listener = SignalListener::install().unwrap();

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let received = tokio::time::timeout(Duration::from_secs(5), listener.recv())
            .await
            .unwrap();
        assert_eq!(received, Termination::Terminate);
    }
}
