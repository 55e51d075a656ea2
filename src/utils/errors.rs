// src/utils/errors.rs
//! Error types for the script runtime
//!
//! A single error enum covers every layer (source loading, engine
//! lifecycle, controller, IPC). Forced stops surface as
//! [`EngineError::EngineTerminated`] and are turned into a `Stopped` task
//! state by the controller rather than reported as failures.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the runtime
#[derive(Debug, Error)]
pub enum EngineError {
    /// The script source could not be read or resolved
    #[error("Invalid script source: {0}")]
    InvalidSource(String),

    /// The interpreter could not be allocated
    #[error("Engine initialization failed: {0}")]
    EngineInit(String),

    /// Operation not valid for the current lifecycle state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Uncaught script exception or rejected top-level promise
    #[error("{0}")]
    ScriptExecution(ScriptFailure),

    /// Stop or query on a task id that was never issued (or has expired)
    #[error("Task not found: {0}")]
    TaskNotFound(u64),

    /// The engine was forcibly stopped
    #[error("Engine terminated")]
    EngineTerminated,

    /// The host-configured execution timeout elapsed
    #[error("Execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the error represents a forced stop rather than a failure
    pub fn is_termination(&self) -> bool {
        matches!(self, EngineError::EngineTerminated)
    }

    /// Shorthand for a script failure that only has a message
    pub fn script(message: impl Into<String>) -> Self {
        EngineError::ScriptExecution(ScriptFailure::new(message))
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Ipc(format!("Serialization error: {}", err))
    }
}

/// Details captured from a failed script run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptFailure {
    /// Exception message (e.g. `Error: boom`)
    pub message: String,

    /// Script stack trace, when the thrown value carried one
    pub stack: Option<String>,

    /// Error-level console lines emitted while the run was failing
    pub console_errors: Vec<String>,
}

impl ScriptFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            console_errors: Vec::new(),
        }
    }

    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack.filter(|s| !s.trim().is_empty());
        self
    }

    /// Message followed by the stack, as written to the console
    pub fn detailed(&self) -> String {
        match &self.stack {
            Some(stack) => format!("{}\n{}", self.message, stack.trim_end()),
            None => self.message.clone(),
        }
    }
}

impl fmt::Display for ScriptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detailed())
    }
}
