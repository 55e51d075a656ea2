// src/runtime/module_resolver.rs
//! Module resolution
//!
//! Shared by `require()` in both engines and by the ES module loader of
//! the node engine. Classic engines only accept relative specifiers; node
//! engines additionally search `node_modules` directories up the tree and
//! a configured module directory.

use crate::runtime::script_source::{detect_file_kind, ModuleKind};
use crate::utils::errors::{EngineError, Result};
use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::Declared;
use rquickjs::{Ctx, Module};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

const EXTENSIONS: [&str; 4] = ["js", "mjs", "cjs", "json"];
const INDEX_FILES: [&str; 3] = ["index.js", "index.mjs", "index.cjs"];

/// Maps a specifier seen in `base_dir` to a file on disk
#[derive(Debug, Clone)]
pub struct ModuleResolver {
    allow_bare: bool,
    module_dir: Option<PathBuf>,
}

impl ModuleResolver {
    /// Relative and absolute specifiers only
    pub fn relative_only() -> Self {
        Self {
            allow_bare: false,
            module_dir: None,
        }
    }

    /// Node-style lookup, falling back to `module_dir` for bare specifiers
    pub fn node(module_dir: Option<PathBuf>) -> Self {
        Self {
            allow_bare: true,
            module_dir,
        }
    }

    pub fn resolve(&self, base_dir: &Path, specifier: &str) -> Result<PathBuf> {
        let spec = specifier.trim();
        let not_found = || {
            EngineError::InvalidSource(format!(
                "Cannot find module '{}' from '{}'",
                specifier,
                base_dir.display()
            ))
        };
        if spec.is_empty() {
            return Err(not_found());
        }

        let found = if is_path_like(spec) {
            resolve_path(&base_dir.join(spec))
        } else if self.allow_bare {
            base_dir
                .ancestors()
                .map(|dir| dir.join("node_modules").join(spec))
                .find_map(|candidate| resolve_path(&candidate))
                .or_else(|| {
                    self.module_dir
                        .as_ref()
                        .and_then(|dir| resolve_path(&dir.join(spec)))
                })
        } else {
            None
        };

        found
            .map(|path| fs::canonicalize(&path).unwrap_or(path))
            .ok_or_else(not_found)
    }
}

fn is_path_like(spec: &str) -> bool {
    spec.starts_with("./") || spec.starts_with("../") || spec.starts_with('/') || spec == "." || spec == ".."
}

fn resolve_path(path: &Path) -> Option<PathBuf> {
    resolve_file(path).or_else(|| resolve_dir(path))
}

fn resolve_file(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    EXTENSIONS.iter().find_map(|ext| {
        let mut name = OsString::from(path.as_os_str());
        name.push(".");
        name.push(ext);
        let candidate = PathBuf::from(name);
        candidate.is_file().then_some(candidate)
    })
}

fn resolve_dir(dir: &Path) -> Option<PathBuf> {
    if !dir.is_dir() {
        return None;
    }
    if let Some(main) = package_main(dir) {
        if let Some(found) = resolve_file(&dir.join(&main)) {
            return Some(found);
        }
    }
    INDEX_FILES
        .iter()
        .map(|index| dir.join(index))
        .find(|candidate| candidate.is_file())
}

fn package_main(dir: &Path) -> Option<String> {
    let text = fs::read_to_string(dir.join("package.json")).ok()?;
    let json: serde_json::Value = serde_json::from_str(&text).ok()?;
    json.get("main")?.as_str().map(str::to_string)
}

/// Source text handed to QuickJS for an imported file. JSON files become
/// a default export; CommonJS files are loaded through `require` and
/// re-exported as the default export.
pub(crate) fn module_source(path: &Path) -> Result<String> {
    let text = fs::read_to_string(path)
        .map_err(|e| EngineError::InvalidSource(format!("{}: {}", path.display(), e)))?;

    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str::<serde_json::Value>(&text)
            .map_err(|e| EngineError::InvalidSource(format!("{}: {}", path.display(), e)))?;
        return Ok(format!("export default {};", text));
    }

    match detect_file_kind(path, &text) {
        ModuleKind::EsModule => Ok(text),
        _ => {
            let literal = serde_json::to_string(&path.to_string_lossy())?;
            Ok(format!(
                "export default globalThis.__autox.requireFile({});",
                literal
            ))
        }
    }
}

/// [`Resolver`] adapter for the QuickJS module loader
pub(crate) struct FsResolver {
    inner: ModuleResolver,
}

impl FsResolver {
    pub(crate) fn new(inner: ModuleResolver) -> Self {
        Self { inner }
    }
}

impl Resolver for FsResolver {
    fn resolve(&mut self, _ctx: &Ctx<'_>, base: &str, name: &str) -> rquickjs::Result<String> {
        let base_dir = Path::new(base).parent().unwrap_or_else(|| Path::new("."));
        self.inner
            .resolve(base_dir, name)
            .map(|path| path.to_string_lossy().into_owned())
            .map_err(|e| rquickjs::Error::new_resolving_message(base, name, e.to_string()))
    }
}

/// [`Loader`] reading modules from disk
pub(crate) struct FsLoader;

impl Loader for FsLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        let source = module_source(Path::new(name))
            .map_err(|e| rquickjs::Error::new_loading_message(name, e.to_string()))?;
        Module::declare(ctx.clone(), name, source)
    }
}
