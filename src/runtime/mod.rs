// src/runtime/mod.rs
//! Script execution runtime
//!
//! - **Script Source**: file or inline code, module kind detection
//! - **Engine**: lifecycle contract and the cross-thread [`StopHandle`]
//! - **Classic / Node engines**: two QuickJS-backed flavours that differ in
//!   module resolution and in whether the top-level result is awaited
//! - **Capabilities**: native functions scripts reach through `host.call`
//! - **Script Runtime**: facade that selects and builds engines
//!
//! # Architecture
//!
//! ```text
//! ScriptRuntime ──create_engine──▶ Box<dyn ScriptEngine>
//!   │                                 ├─ ClassicEngine ─┐
//!   ├─ global Console                 └─ NodeEngine ────┴─▶ EngineCore ─▶ JsContext
//!   └─ CapabilityTable ◀──────────── host.call ─────────────────────────────┘
//! ```

pub mod capabilities;
pub mod classic_engine;
pub mod engine;
pub mod execution_config;
pub mod js_context;
pub mod module_resolver;
pub mod node_engine;
pub mod script_runtime;
pub mod script_source;

use serde::{Deserialize, Serialize};

pub use capabilities::{CallContext, CapabilityTable, HostCapability};
pub use classic_engine::ClassicEngine;
pub use engine::{EngineState, ScriptEngine, StopHandle};
pub use execution_config::{ExecutionConfig, LoopMode};
pub use js_context::EngineOptions;
pub use module_resolver::ModuleResolver;
pub use node_engine::NodeEngine;
pub use script_runtime::ScriptRuntime;
pub use script_source::{LoadedScript, ModuleKind, ScriptSource, SourceOrigin};

/// Engine flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Global-script engine with relative `require`
    Classic,

    /// ES modules, `node_modules` lookup, awaited top-level result
    Node,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Classic => "classic",
            EngineKind::Node => "node",
        }
    }
}
