mod barrier;
mod fault;
mod launcher;

pub use fault::{PanicPayload, TaskFault};
pub use launcher::{TaskExit, TaskLauncher, TaskOptions};
