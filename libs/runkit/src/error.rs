use std::sync::Arc;

use crate::tasks::TaskFault;

/// Errors surfaced by [`crate::runtime::Orchestrator::run`].
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    /// A component failed to start; already-started components were closed.
    #[error("component '{component}' failed to start: {source}")]
    Start {
        component: String,
        #[source]
        source: anyhow::Error,
    },
    /// A supervised task panicked without opting into containment.
    #[error("supervised {0}")]
    TaskFault(Arc<TaskFault>),
}

impl RuntimeError {
    /// Name of the component that failed to start, if that is the failure.
    #[must_use]
    pub fn component(&self) -> Option<&str> {
        match self {
            Self::Start { component, .. } => Some(component),
            Self::TaskFault(_) => None,
        }
    }
}
