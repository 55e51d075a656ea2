// src/controller/listener.rs
//! Run listeners and task observers

use crate::controller::task::{TaskEvent, TaskInfo};
use crate::utils::errors::EngineError;

/// Callbacks for a single run.
///
/// `on_start` is always delivered first, followed by exactly one of
/// `on_success`, `on_exception` or `on_stopped`.
pub trait ExecutionListener: Send + Sync {
    fn on_start(&self, _task: &TaskInfo) {}

    fn on_success(&self, _task: &TaskInfo, _result: &serde_json::Value) {}

    fn on_exception(&self, _task: &TaskInfo, _error: &EngineError) {}

    fn on_stopped(&self, _task: &TaskInfo) {}
}

/// Listener that ignores every callback
pub struct NoopListener;

impl ExecutionListener for NoopListener {}

/// Receives the transitions of every task of a controller
pub trait TaskObserver: Send + Sync {
    fn on_task_event(&self, event: &TaskEvent);
}

impl<F> TaskObserver for F
where
    F: Fn(&TaskEvent) + Send + Sync,
{
    fn on_task_event(&self, event: &TaskEvent) {
        self(event)
    }
}
