mod orchestrator;
mod signals;

pub use orchestrator::{LifecycleState, Orchestrator, ShutdownOptions};
