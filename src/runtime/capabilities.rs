// src/runtime/capabilities.rs
//! Host capabilities exposed to scripts
//!
//! Native functionality is registered up front in a [`CapabilityTable`]
//! and invoked from scripts as `host.call(name, ...args)`. Arguments and
//! results cross the boundary as JSON.

use crate::utils::errors::{EngineError, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Context of a capability call
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    /// Working directory of the calling run
    pub working_dir: &'a Path,

    /// Id of the calling task, when run through the controller
    pub task_id: Option<u64>,
}

impl CallContext<'_> {
    /// Resolve a script-supplied path against the working directory
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        self.working_dir.join(path)
    }
}

/// A native function callable from scripts
pub trait HostCapability: Send + Sync {
    fn call(&self, cx: &CallContext<'_>, args: &[Value]) -> Result<Value>;
}

impl<F> HostCapability for F
where
    F: Fn(&CallContext<'_>, &[Value]) -> Result<Value> + Send + Sync,
{
    fn call(&self, cx: &CallContext<'_>, args: &[Value]) -> Result<Value> {
        self(cx, args)
    }
}

/// Registry of named capabilities
#[derive(Default)]
pub struct CapabilityTable {
    entries: RwLock<HashMap<String, Arc<dyn HostCapability>>>,
}

impl CapabilityTable {
    /// An empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with the built-in `files.*`, `clip.*` and `device.info`
    pub fn with_builtins() -> Self {
        let table = Self::new();
        table.register("files.read", files_read);
        table.register("files.write", files_write);
        table.register("files.exists", files_exists);
        table.register("files.list", files_list);

        let clipboard = Arc::new(Mutex::new(String::new()));
        let clip = Arc::clone(&clipboard);
        table.register("clip.set", move |_: &CallContext<'_>, args: &[Value]| {
            *clip.lock() = string_arg(args, 0, "clip.set")?;
            Ok(Value::Null)
        });
        table.register("clip.get", move |_: &CallContext<'_>, _: &[Value]| {
            Ok(Value::String(clipboard.lock().clone()))
        });

        table.register("device.info", device_info);
        table
    }

    /// Register (or replace) a capability
    pub fn register(&self, name: impl Into<String>, capability: impl HostCapability + 'static) {
        let name = name.into();
        debug!("Registering host capability {}", name);
        self.entries.write().insert(name, Arc::new(capability));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke a capability. The table lock is not held during the call,
    /// so capabilities may register others.
    pub fn call(&self, name: &str, cx: &CallContext<'_>, args: &[Value]) -> Result<Value> {
        let capability = self
            .entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::script(format!("Unknown host capability '{}'", name)))?;
        capability.call(cx, args)
    }
}

fn string_arg(args: &[Value], index: usize, name: &str) -> Result<String> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(EngineError::script(format!(
            "{}: missing argument {}",
            name,
            index + 1
        ))),
    }
}

fn io_failure(name: &str, path: &Path, err: std::io::Error) -> EngineError {
    EngineError::script(format!("{}: {}: {}", name, path.display(), err))
}

fn files_read(cx: &CallContext<'_>, args: &[Value]) -> Result<Value> {
    let path = cx.resolve_path(&string_arg(args, 0, "files.read")?);
    fs::read_to_string(&path)
        .map(Value::String)
        .map_err(|e| io_failure("files.read", &path, e))
}

fn files_write(cx: &CallContext<'_>, args: &[Value]) -> Result<Value> {
    let path = cx.resolve_path(&string_arg(args, 0, "files.write")?);
    let text = string_arg(args, 1, "files.write")?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_failure("files.write", parent, e))?;
    }
    fs::write(&path, text).map_err(|e| io_failure("files.write", &path, e))?;
    Ok(Value::Null)
}

fn files_exists(cx: &CallContext<'_>, args: &[Value]) -> Result<Value> {
    let path = cx.resolve_path(&string_arg(args, 0, "files.exists")?);
    Ok(Value::Bool(path.exists()))
}

fn files_list(cx: &CallContext<'_>, args: &[Value]) -> Result<Value> {
    let dir = match args.first() {
        Some(_) => cx.resolve_path(&string_arg(args, 0, "files.list")?),
        None => cx.working_dir.to_path_buf(),
    };
    let mut names = fs::read_dir(&dir)
        .map_err(|e| io_failure("files.list", &dir, e))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    names.sort();
    Ok(json!(names))
}

fn device_info(_: &CallContext<'_>, _: &[Value]) -> Result<Value> {
    Ok(json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "family": std::env::consts::FAMILY,
        "cpus": std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        "engineVersion": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cx(dir: &Path) -> CallContext<'_> {
        CallContext {
            working_dir: dir,
            task_id: None,
        }
    }

    #[test]
    fn test_files_round_trip() {
        let dir = TempDir::new().unwrap();
        let table = CapabilityTable::with_builtins();
        let cx = cx(dir.path());

        table
            .call("files.write", &cx, &[json!("out/a.txt"), json!("hello")])
            .unwrap();
        assert_eq!(table.call("files.exists", &cx, &[json!("out/a.txt")]).unwrap(), json!(true));
        assert_eq!(table.call("files.read", &cx, &[json!("out/a.txt")]).unwrap(), json!("hello"));
        assert_eq!(table.call("files.list", &cx, &[json!("out")]).unwrap(), json!(["a.txt"]));
    }

    #[test]
    fn test_clipboard_is_shared_per_table() {
        let dir = TempDir::new().unwrap();
        let table = CapabilityTable::with_builtins();
        let cx = cx(dir.path());
        table.call("clip.set", &cx, &[json!("copied")]).unwrap();
        assert_eq!(table.call("clip.get", &cx, &[]).unwrap(), json!("copied"));
    }

    #[test]
    fn test_unknown_capability() {
        let dir = TempDir::new().unwrap();
        let table = CapabilityTable::new();
        let err = table.call("gesture.swipe", &cx(dir.path()), &[]).unwrap_err();
        assert!(err.to_string().contains("gesture.swipe"));
    }

    #[test]
    fn test_custom_capability_receives_context() {
        let dir = TempDir::new().unwrap();
        let table = CapabilityTable::new();
        table.register("task.id", |cx: &CallContext<'_>, _: &[Value]| Ok(json!(cx.task_id)));

        let cx = CallContext {
            working_dir: dir.path(),
            task_id: Some(9),
        };
        assert_eq!(table.call("task.id", &cx, &[]).unwrap(), json!(9));
        assert!(table.unregister("task.id"));
        assert!(!table.contains("task.id"));
    }

    #[test]
    fn test_missing_argument() {
        let dir = TempDir::new().unwrap();
        let table = CapabilityTable::with_builtins();
        assert!(table.call("files.read", &cx(dir.path()), &[]).is_err());
    }
}
