// src/lib.rs
//! AutoX Script Execution Runtime
//!
//! Runs automation scripts on embedded QuickJS engines, tracks each run as
//! a task and streams script output through console sinks.
//!
//! # Architecture
//!
//! - **runtime**: script sources, engine lifecycle, classic and node
//!   engines, host capabilities and the [`ScriptRuntime`] facade
//! - **controller**: task registry, admission and stop handling
//! - **console**: bounded log buffers with ordered subscribers
//! - **ipc**: JSON-lines protocol, server and client
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and error types
//!
//! # Example
//!
//! ```no_run
//! use autox_engine::{EngineController, ExecutionConfig, NoopListener, RuntimeConfig, ScriptRuntime, ScriptSource};
//! use std::sync::Arc;
//!
//! # async fn demo() -> autox_engine::Result<()> {
//! let runtime = Arc::new(ScriptRuntime::new(RuntimeConfig::load()?));
//! let controller = EngineController::new(runtime)?;
//! let task = controller.run_script(
//!     ScriptSource::inline("hello", "console.log('hi'); 1 + 1"),
//!     ExecutionConfig::default(),
//!     Arc::new(NoopListener),
//! );
//! let done = controller.wait(task.id).await?;
//! assert_eq!(done.result, Some(serde_json::json!(2)));
//! # Ok(())
//! # }
//! ```

pub mod console;
pub mod controller;
pub mod ipc;
pub mod observability;
pub mod runtime;
pub mod utils;

pub use console::{Console, LogEntry, LogLevel};
pub use controller::{EngineController, ExecutionListener, NoopListener, TaskId, TaskInfo, TaskState};
pub use runtime::{EngineKind, ExecutionConfig, ScriptEngine, ScriptRuntime, ScriptSource};
pub use utils::config::RuntimeConfig;
pub use utils::errors::{EngineError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
