// src/ipc/protocol.rs
//! Wire messages
//!
//! One JSON object per line, tagged by `type`.

use crate::console::LogEntry;
use crate::controller::{TaskEvent, TaskId, TaskInfo};
use crate::runtime::{ExecutionConfig, ModuleKind, ScriptSource};
use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Maximum accepted line length
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Script to run, as sent by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    File {
        path: PathBuf,
    },
    Inline {
        name: String,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        module: Option<ModuleKind>,
    },
}

impl SourceSpec {
    pub fn inline(name: impl Into<String>, code: impl Into<String>) -> Self {
        SourceSpec::Inline {
            name: name.into(),
            code: code.into(),
            module: None,
        }
    }
}

impl From<SourceSpec> for ScriptSource {
    fn from(spec: SourceSpec) -> Self {
        match spec {
            SourceSpec::File { path } => ScriptSource::from_file(path),
            SourceSpec::Inline { name, code, module } => {
                let source = ScriptSource::inline(name, code);
                match module {
                    Some(kind) => source.with_kind(kind),
                    None => source,
                }
            }
        }
    }
}

/// Client → server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Run {
        source: SourceSpec,
        #[serde(default)]
        config: ExecutionConfig,
    },
    Stop {
        task_id: TaskId,
    },
    StopAll,
    ListTasks,
    ClearConsole,
    SubmitInput {
        /// Target task; the oldest waiting task when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<TaskId>,
        text: String,
    },
}

/// Server → client: replies in request order, interleaved with events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Submitted { task: TaskInfo },
    Stopped { task_id: TaskId, issued: bool },
    StoppedAll { count: usize },
    Tasks { tasks: Vec<TaskInfo> },
    Ack,
    Error { message: String },
    TaskEvent { event: TaskEvent },
    Log { entry: LogEntry },
    LogCleared,
}

impl ServerMessage {
    /// Whether this message answers a request (as opposed to an event)
    pub fn is_reply(&self) -> bool {
        !matches!(
            self,
            ServerMessage::TaskEvent { .. } | ServerMessage::Log { .. } | ServerMessage::LogCleared
        )
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T> {
    Ok(serde_json::from_str(line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let request: Request = decode(
            r#"{"type":"run","source":{"kind":"inline","name":"a","code":"1+1"},"config":{"timeout_ms":500}}"#,
        )
        .unwrap();
        match request {
            Request::Run { source, config } => {
                assert_eq!(source, SourceSpec::inline("a", "1+1"));
                assert_eq!(config.timeout_ms, Some(500));
            }
            other => panic!("unexpected {:?}", other),
        }

        let stop: Request = decode(r#"{"type":"stop","task_id":4}"#).unwrap();
        assert_eq!(stop, Request::Stop { task_id: 4 });
        assert_eq!(decode::<Request>(r#"{"type":"stop_all"}"#).unwrap(), Request::StopAll);
    }

    #[test]
    fn test_run_config_is_optional() {
        let request: Request =
            decode(r#"{"type":"run","source":{"kind":"file","path":"/tmp/a.js"}}"#).unwrap();
        assert_eq!(
            request,
            Request::Run {
                source: SourceSpec::File { path: "/tmp/a.js".into() },
                config: ExecutionConfig::default(),
            }
        );
    }

    #[test]
    fn test_server_message_tags() {
        let json = serde_json::to_value(ServerMessage::Stopped { task_id: 2, issued: true }).unwrap();
        assert_eq!(json, json!({"type": "stopped", "task_id": 2, "issued": true}));
        assert_eq!(
            serde_json::to_value(ServerMessage::LogCleared).unwrap(),
            json!({"type": "log_cleared"})
        );
        assert!(ServerMessage::Ack.is_reply());
        assert!(!ServerMessage::LogCleared.is_reply());
    }

    #[test]
    fn test_malformed_request_is_an_error() {
        assert!(decode::<Request>(r#"{"type":"launch"}"#).is_err());
        assert!(decode::<Request>("not json").is_err());
    }

    #[test]
    fn test_inline_module_kind() {
        let source: ScriptSource = SourceSpec::Inline {
            name: "m".into(),
            code: "export default 1".into(),
            module: Some(ModuleKind::EsModule),
        }
        .into();
        assert_eq!(source.module_kind(), ModuleKind::EsModule);
    }
}
