#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! `runkit`: an in-process runtime for long-running services.
//!
//! - [`Orchestrator`] starts registered components in order, waits for a
//!   shutdown signal (or a component-initiated cancel) and closes them in
//!   reverse order, rolling back on startup failure.
//! - [`TaskLauncher`] runs supervised background tasks behind a single join
//!   barrier; a panicking task either stays contained or fails the whole
//!   process fast, depending on [`TaskOptions::with_ignore_fault`].
//! - [`Config`] resolves typed configuration sections from pluggable
//!   [`Source`](config::Source) backends; persistent backends seed missing
//!   sections with the caller's defaults.
//!
//! # Example
//! ```rust,no_run
//! use runkit::{Config, Orchestrator, ShutdownOptions, component_fn};
//! use std::sync::Arc;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = Arc::new(Config::builder("demo").build());
//! let orchestrator = Orchestrator::new(config, ShutdownOptions::Signals)
//!     .register(component_fn("hello", |ctx| async move {
//!         tracing::info!(component = ctx.component_name(), "started");
//!         Ok(())
//!     }));
//! orchestrator.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod contracts;
pub mod context;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod sources;
pub mod tasks;

pub use config::{Config, ConfigError, Env};
pub use contracts::{CancellableComponent, Component, FnComponent, ShutdownHandle, component_fn};
pub use context::ComponentCtx;
pub use error::RuntimeError;
pub use runtime::{LifecycleState, Orchestrator, ShutdownOptions};
pub use tasks::{TaskExit, TaskFault, TaskLauncher, TaskOptions};
