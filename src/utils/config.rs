// src/utils/config.rs
//! Runtime configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! `autox.{toml,yaml,json}` file (or the file named by `AUTOX_CONFIG`), then
//! `AUTOX__SECTION__KEY` environment overrides.

use crate::console::OverflowPolicy;
use crate::runtime::EngineKind;
use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub controller: ControllerSettings,
    pub console: ConsoleSettings,
    pub engine: EngineSettings,
    pub server: ServerSettings,
}

impl RuntimeConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        let file = std::env::var("AUTOX_CONFIG").unwrap_or_else(|_| "autox".to_string());
        Self::load_from(&file)
    }

    /// Load configuration using `file` as the optional config file name
    pub fn load_from(file: &str) -> Result<Self> {
        debug!("Loading configuration from {:?}", file);

        let settings = config::Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(
                config::Environment::with_prefix("AUTOX")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

/// Controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Maximum concurrently running scripts (0 = unbounded)
    pub max_concurrent: usize,

    /// How long finished tasks stay queryable, in seconds
    pub retention_secs: u64,
}

impl ControllerSettings {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            retention_secs: 300,
        }
    }
}

/// Console sink settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSettings {
    /// Retention bound for the global console (<= 0 disables bounding)
    pub max_lines: i64,

    /// What happens once `max_lines` is exceeded
    pub overflow: OverflowPolicy,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            max_lines: 10_000,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Interpreter settings shared by every engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// QuickJS heap limit in MB (0 = unlimited)
    pub memory_limit_mb: usize,

    /// QuickJS stack limit in KB (0 = interpreter default)
    pub max_stack_kb: usize,

    /// Extra directory searched for bare module specifiers
    pub module_dir: Option<PathBuf>,

    /// Timeout applied when a run does not set one (0 = none)
    pub default_timeout_secs: u64,

    /// Engine used for inline sources that do not pick one
    pub default_kind: EngineKind,
}

impl EngineSettings {
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_secs > 0).then(|| Duration::from_secs(self.default_timeout_secs))
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            memory_limit_mb: 64,
            max_stack_kb: 1024,
            module_dir: None,
            default_timeout_secs: 0,
            default_kind: EngineKind::Classic,
        }
    }
}

/// IPC server settings for the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,

    /// Prometheus exporter port (0 disables the exporter)
    pub metrics_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7347,
            metrics_port: 0,
        }
    }
}
