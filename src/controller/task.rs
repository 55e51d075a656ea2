// src/controller/task.rs
//! Task records

use crate::runtime::EngineKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task identifier, monotonic per controller
pub type TaskId = u64;

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Stopped
        )
    }

    /// Transitions only move forward: pending → running → terminal
    pub fn can_transition_to(self, next: TaskState) -> bool {
        match (self, next) {
            (TaskState::Pending, TaskState::Running) => true,
            (TaskState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Stopped => "stopped",
        }
    }
}

/// Snapshot of a submitted run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,

    /// Script name
    pub name: String,

    /// Path or inline marker identifying the source
    pub source: String,

    /// Engine flavour, known once the task starts
    pub engine: Option<EngineKind>,

    pub state: TaskState,

    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Failure text for failed tasks
    pub error: Option<String>,

    /// Settled value for succeeded tasks
    pub result: Option<serde_json::Value>,
}

impl TaskInfo {
    pub(crate) fn new(id: TaskId, name: &str, source: String) -> Self {
        Self {
            id,
            name: name.to_string(),
            source,
            engine: None,
            state: TaskState::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            result: None,
        }
    }
}

/// A state transition as seen by task observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// State the task entered
    pub state: TaskState,
    pub task: TaskInfo,
}

impl TaskEvent {
    pub(crate) fn of(task: &TaskInfo) -> Self {
        Self {
            state: task.state,
            task: task.clone(),
        }
    }
}
