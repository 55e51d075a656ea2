// src/runtime/execution_config.rs
//! Per-run execution options

use crate::runtime::EngineKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// What the engine does with pending timers once the top-level code settles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    /// Keep running until no timers or jobs remain
    #[default]
    UntilIdle,

    /// Drain the job queue once and drop remaining timers
    Once,
}

/// Options for a single script run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Base directory for relative paths; the script directory or the
    /// process working directory when absent
    pub working_dir: Option<PathBuf>,

    pub loop_mode: LoopMode,

    /// Wall-clock limit for the run, in milliseconds
    pub timeout_ms: Option<u64>,

    /// Extra `process.env` entries (node engine)
    pub env: BTreeMap<String, String>,

    /// Extra `process.argv` entries (node engine)
    pub argv: Vec<String>,

    /// Forces an engine; chosen from the source kind when absent
    pub engine: Option<EngineKind>,

    /// Opaque tags exposed to the script as `engine.tags`
    pub tags: BTreeMap<String, serde_json::Value>,
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_engine(mut self, kind: EngineKind) -> Self {
        self.engine = Some(kind);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.tags.insert(key.into(), value);
        self
    }
}
