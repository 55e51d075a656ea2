// src/runtime/script_source.rs
//! Script sources
//!
//! A [`ScriptSource`] names what to run: a file on disk or an inline
//! snippet. Content is read lazily by the engine at execution time, so
//! constructing a source never touches the filesystem.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How a source is evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// Global script, AutoJs style
    Classic,

    /// CommonJS module (`require` / `module.exports`)
    CommonJs,

    /// ECMAScript module (`import` / `export`)
    EsModule,
}

/// Where the code comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOrigin {
    File(PathBuf),
    Inline(Arc<str>),
}

/// An immutable, cheaply cloneable script descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSource {
    name: Arc<str>,
    origin: SourceOrigin,

    /// Explicit kind; detected from the origin when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<ModuleKind>,
}

/// Source content plus everything resolved while reading it
#[derive(Debug, Clone)]
pub struct LoadedScript {
    pub name: String,
    pub code: String,
    pub kind: ModuleKind,

    /// Absolute path for file sources
    pub path: Option<PathBuf>,
}

impl LoadedScript {
    /// Directory relative imports resolve against
    pub fn base_dir(&self, working_dir: &Path) -> PathBuf {
        self.path
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| working_dir.to_path_buf())
    }

    /// Module name handed to the interpreter
    pub fn module_name(&self, working_dir: &Path) -> String {
        match &self.path {
            Some(path) => path.to_string_lossy().into_owned(),
            None => working_dir.join(&self.name).to_string_lossy().into_owned(),
        }
    }
}

impl ScriptSource {
    /// A file source; the file is not opened until the script runs
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            name: name.into(),
            origin: SourceOrigin::File(path),
            kind: None,
        }
    }

    /// An inline snippet, evaluated as a classic script unless overridden
    pub fn inline(name: impl Into<String>, code: impl Into<String>) -> Self {
        let code: String = code.into();
        Self {
            name: name.into().into(),
            origin: SourceOrigin::Inline(code.into()),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: ModuleKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> &SourceOrigin {
        &self.origin
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.origin {
            SourceOrigin::File(path) => Some(path),
            SourceOrigin::Inline(_) => None,
        }
    }

    /// Human readable identity used in task records and logs
    pub fn identity(&self) -> String {
        match &self.origin {
            SourceOrigin::File(path) => path.to_string_lossy().into_owned(),
            SourceOrigin::Inline(_) => format!("<inline:{}>", self.name),
        }
    }

    /// Module kind, detecting it from the file when not set explicitly.
    /// Unreadable files are reported as CommonJS; the read error surfaces
    /// later from [`ScriptSource::load`].
    pub fn module_kind(&self) -> ModuleKind {
        if let Some(kind) = self.kind {
            return kind;
        }
        match &self.origin {
            SourceOrigin::Inline(_) => ModuleKind::Classic,
            SourceOrigin::File(path) => {
                let content = fs::read_to_string(path).unwrap_or_default();
                detect_file_kind(path, &content)
            }
        }
    }

    /// Current content of the source
    pub fn read(&self) -> Result<String> {
        match &self.origin {
            SourceOrigin::Inline(code) => Ok(code.to_string()),
            SourceOrigin::File(path) => read_file(&absolute(path)),
        }
    }

    /// Read the content and resolve the module kind
    pub fn load(&self) -> Result<LoadedScript> {
        match &self.origin {
            SourceOrigin::Inline(code) => Ok(LoadedScript {
                name: self.name.to_string(),
                code: code.to_string(),
                kind: self.kind.unwrap_or(ModuleKind::Classic),
                path: None,
            }),
            SourceOrigin::File(path) => {
                let path = absolute(path);
                let code = read_file(&path)?;
                let kind = self
                    .kind
                    .unwrap_or_else(|| detect_file_kind(&path, &code));
                Ok(LoadedScript {
                    name: self.name.to_string(),
                    code,
                    kind,
                    path: Some(path),
                })
            }
        }
    }
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| EngineError::InvalidSource(format!("{}: {}", path.display(), e)))
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Detect the module kind of a file from its extension, the nearest
/// `package.json` and finally the content itself
pub fn detect_file_kind(path: &Path, content: &str) -> ModuleKind {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mjs") => return ModuleKind::EsModule,
        Some("cjs") => return ModuleKind::CommonJs,
        _ => {}
    }

    if nearest_package_type(path).as_deref() == Some("module") || has_module_syntax(content) {
        ModuleKind::EsModule
    } else {
        ModuleKind::CommonJs
    }
}

/// The `type` field of the closest enclosing `package.json`
fn nearest_package_type(path: &Path) -> Option<String> {
    let path = absolute(path);
    for dir in path.ancestors().skip(1) {
        let manifest = dir.join("package.json");
        if manifest.is_file() {
            let text = fs::read_to_string(&manifest).ok()?;
            let json: serde_json::Value = serde_json::from_str(&text).ok()?;
            return json
                .get("type")
                .and_then(|t| t.as_str())
                .map(str::to_string);
        }
    }
    None
}

/// Whether the code has a top-level `import … from` or `export` statement
pub fn has_module_syntax(content: &str) -> bool {
    let mut in_block_comment = false;
    for line in content.lines() {
        let mut line = line.trim_start();
        if in_block_comment {
            match line.find("*/") {
                Some(end) => {
                    in_block_comment = false;
                    line = line[end + 2..].trim_start();
                }
                None => continue,
            }
        }
        if line.starts_with("/*") {
            if !line.contains("*/") {
                in_block_comment = true;
            }
            continue;
        }
        if line.starts_with("//") {
            continue;
        }

        if line.starts_with("export ") || line.starts_with("export{") {
            return true;
        }
        if let Some(rest) = line.strip_prefix("import") {
            // `import(...)` is a dynamic import and valid in scripts
            let rest = rest.trim_start();
            if rest.starts_with('(') || rest.starts_with('.') {
                continue;
            }
            if rest.starts_with('"') || rest.starts_with('\'') || rest.contains(" from ") {
                return true;
            }
            if rest.starts_with('{') || rest.starts_with('*') {
                return true;
            }
        }
    }
    false
}
