// src/runtime/script_runtime.rs
//! Runtime facade
//!
//! [`ScriptRuntime`] is the explicit, shareable replacement for a process
//! wide engine manager: it owns the global console and the capability
//! table, picks an engine flavour for a source and builds engines wired to
//! both.

use crate::console::Console;
use crate::runtime::capabilities::CapabilityTable;
use crate::runtime::classic_engine::ClassicEngine;
use crate::runtime::engine::ScriptEngine;
use crate::runtime::execution_config::ExecutionConfig;
use crate::runtime::js_context::EngineOptions;
use crate::runtime::node_engine::NodeEngine;
use crate::runtime::script_source::{ModuleKind, ScriptSource};
use crate::runtime::EngineKind;
use crate::utils::config::RuntimeConfig;
use crate::utils::errors::Result;
use std::sync::Arc;
use tracing::debug;

pub struct ScriptRuntime {
    config: RuntimeConfig,
    console: Arc<Console>,
    capabilities: Arc<CapabilityTable>,
}

impl ScriptRuntime {
    /// Runtime with the built-in capabilities
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_capabilities(config, Arc::new(CapabilityTable::with_builtins()))
    }

    pub fn with_capabilities(config: RuntimeConfig, capabilities: Arc<CapabilityTable>) -> Self {
        let console = Console::with_settings("global", &config.console);
        Self {
            config,
            console,
            capabilities,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The global console every task console mirrors into
    pub fn console(&self) -> &Arc<Console> {
        &self.console
    }

    pub fn capabilities(&self) -> &Arc<CapabilityTable> {
        &self.capabilities
    }

    /// Engine flavour for `source`: an explicit choice wins, ES modules
    /// need the node engine, everything else uses the configured default
    pub fn select_kind(&self, source: &ScriptSource, config: &ExecutionConfig) -> EngineKind {
        if let Some(kind) = config.engine {
            return kind;
        }
        match source.module_kind() {
            ModuleKind::EsModule => EngineKind::Node,
            _ => self.config.engine.default_kind,
        }
    }

    /// Build an uninitialised engine of `kind` logging into `console`
    pub fn create_engine(
        &self,
        kind: EngineKind,
        mut config: ExecutionConfig,
        console: Arc<Console>,
        task_id: Option<u64>,
    ) -> Box<dyn ScriptEngine> {
        if config.timeout_ms.is_none() {
            if let Some(timeout) = self.config.engine.default_timeout() {
                config = config.with_timeout(timeout);
            }
        }
        let options = EngineOptions {
            settings: self.config.engine.clone(),
            config,
            console,
            capabilities: Arc::clone(&self.capabilities),
            task_id,
        };

        debug!("Creating {:?} engine", kind);
        match kind {
            EngineKind::Classic => Box::new(ClassicEngine::new(options)),
            EngineKind::Node => Box::new(NodeEngine::new(options)),
        }
    }

    /// Run `source` to completion on the calling thread, logging into the
    /// global console
    pub fn run_blocking(
        &self,
        source: &ScriptSource,
        config: ExecutionConfig,
    ) -> Result<serde_json::Value> {
        let kind = self.select_kind(source, &config);
        let mut engine = self.create_engine(kind, config, Arc::clone(&self.console), None);
        let result = engine.init().and_then(|_| engine.execute(source));
        engine.destroy();
        result
    }
}
