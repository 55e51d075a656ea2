// src/runtime/node_engine.rs
//! Node-compatible engine
//!
//! ES modules go through the QuickJS module loader (relative paths,
//! `node_modules`, the configured module directory, `package.json#main`).
//! CommonJS entry points run through `require` with a module cache. The
//! top-level result (default export, `module.exports` or completion value)
//! is awaited when it is a promise, and `process` is available.

use crate::runtime::engine::{EngineState, ScriptEngine, StopHandle};
use crate::runtime::js_context::{process_info, EngineCore, EngineOptions};
use crate::runtime::module_resolver::ModuleResolver;
use crate::runtime::script_source::{ModuleKind, ScriptSource};
use crate::runtime::EngineKind;
use crate::utils::errors::Result;
use std::sync::Arc;

pub struct NodeEngine {
    core: EngineCore,
}

impl NodeEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            core: EngineCore::new(EngineKind::Node, options),
        }
    }

    fn resolver(&self) -> ModuleResolver {
        ModuleResolver::node(self.core.options().settings.module_dir.clone())
    }
}

impl ScriptEngine for NodeEngine {
    fn kind(&self) -> EngineKind {
        self.core.kind()
    }

    fn state(&self) -> EngineState {
        self.core.state()
    }

    fn init(&mut self) -> Result<()> {
        let resolver = self.resolver();
        self.core.init(resolver, true)
    }

    fn put(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        self.core.put(key, value)
    }

    fn execute(&mut self, source: &ScriptSource) -> Result<serde_json::Value> {
        if self.core.state() == EngineState::Created {
            self.init()?;
        }
        self.core.execute(source, |js, script, options| {
            let working_dir = options.working_dir();
            let name = script.module_name(&working_dir);

            js.call::<_, ()>("installProcess", (process_info(options, script)?,))?;
            let base = script.base_dir(&working_dir);
            js.call::<_, ()>("installRequire", (base.to_string_lossy().into_owned(),))?;

            match script.kind {
                ModuleKind::EsModule => js.eval_module(&name, &script.code)?,
                ModuleKind::CommonJs => js.eval_commonjs(&name, &script.code)?,
                ModuleKind::Classic => js.eval_script_tracked(&script.code)?,
            }

            js.run_loop(options.config.loop_mode, true)?;
            js.outcome()
        })
    }

    fn stop_handle(&self) -> Arc<StopHandle> {
        self.core.stop_handle()
    }

    fn destroy(&mut self) {
        self.core.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::Console;
    use crate::utils::errors::EngineError;
    use serde_json::json;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn run(source: ScriptSource) -> (Result<serde_json::Value>, Arc<Console>) {
        let console = Console::new("test");
        let mut engine = NodeEngine::new(EngineOptions::new(Arc::clone(&console)));
        let result = engine.execute(&source);
        engine.destroy();
        (result, console)
    }

    fn contents(console: &Console) -> Vec<String> {
        console.entries().into_iter().map(|e| e.content).collect()
    }

    #[test]
    fn test_es_module_imports_and_default_export() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "lib/greet.mjs", "export const greet = (n) => `hello ${n}`;");
        write(dir.path(), "data.json", r#"{"name": "autox"}"#);
        let main = write(
            dir.path(),
            "main.mjs",
            r#"
            import { greet } from './lib/greet.mjs';
            import data from './data.json';
            console.log(greet(data.name));
            export default { ok: true };
            "#,
        );

        let (result, console) = run(ScriptSource::from_file(main));
        assert_eq!(result.unwrap(), json!({"ok": true}));
        assert_eq!(contents(&console), vec!["hello autox"]);
    }

    #[test]
    fn test_top_level_await_and_promise_default() {
        let dir = TempDir::new().unwrap();
        let main = write(
            dir.path(),
            "main.mjs",
            r#"
            const wait = (ms) => new Promise((resolve) => setTimeout(resolve, ms));
            await wait(10);
            console.log('waited');
            export default wait(5).then(() => 'done');
            "#,
        );
        let (result, console) = run(ScriptSource::from_file(main));
        assert_eq!(result.unwrap(), json!("done"));
        assert_eq!(contents(&console), vec!["waited"]);
    }

    #[test]
    fn test_node_modules_and_commonjs_interop() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "node_modules/counter/package.json",
            r#"{"main": "lib/index.js"}"#,
        );
        write(
            dir.path(),
            "node_modules/counter/lib/index.js",
            "let n = 0; module.exports = { next: () => ++n };",
        );
        let main = write(
            dir.path(),
            "main.mjs",
            "import counter from 'counter'; counter.next(); export default counter.next();",
        );
        let (result, _console) = run(ScriptSource::from_file(main));
        assert_eq!(result.unwrap(), json!(2));
    }

    #[test]
    fn test_commonjs_entry() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "config.json", r#"{"retries": 2}"#);
        write(dir.path(), "util.js", "exports.double = (x) => x * 2;");
        let main = write(
            dir.path(),
            "main.cjs",
            r#"
            const { double } = require('./util');
            const config = require('./config.json');
            module.exports = {
                value: double(config.retries),
                sameModule: require('./util') === require('./util.js'),
                file: __filename.endsWith('main.cjs'),
            };
            "#,
        );
        let (result, _console) = run(ScriptSource::from_file(main));
        assert_eq!(
            result.unwrap(),
            json!({"value": 4, "sameModule": true, "file": true})
        );
    }

    #[test]
    fn test_inline_classic_awaits_promise() {
        let (result, _console) = run(ScriptSource::inline(
            "main",
            "new Promise((resolve) => setTimeout(() => resolve(7), 5))",
        ));
        assert_eq!(result.unwrap(), json!(7));
    }

    #[test]
    fn test_rejected_top_level_promise() {
        let (result, console) = run(ScriptSource::inline(
            "main",
            "Promise.reject(new RangeError('out of range'))",
        ));
        match result {
            Err(EngineError::ScriptExecution(failure)) => {
                assert_eq!(failure.message, "RangeError: out of range");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(console.error_lines()[0].contains("out of range"));
    }

    #[test]
    fn test_never_settled_promise() {
        let (result, _console) = run(ScriptSource::inline("main", "new Promise(() => {})"));
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("never settled"));
    }

    #[test]
    fn test_process_surface() {
        let dir = TempDir::new().unwrap();
        let console = Console::new("test");
        let mut options = EngineOptions::new(Arc::clone(&console));
        options.config.working_dir = Some(dir.path().to_path_buf());
        options.config.env.insert("AUTOX_MODE".into(), "test".into());
        options.config.argv.push("--fast".into());
        let mut engine = NodeEngine::new(options);

        let value = engine
            .execute(&ScriptSource::inline(
                "main",
                "({ mode: process.env.AUTOX_MODE, last: process.argv[process.argv.length - 1], cwd: process.cwd() })",
            ))
            .unwrap();
        assert_eq!(value["mode"], json!("test"));
        assert_eq!(value["last"], json!("--fast"));
        assert_eq!(value["cwd"], json!(dir.path().to_string_lossy()));
    }

    #[test]
    fn test_process_exit_codes() {
        let (ok, console) = run(ScriptSource::inline(
            "main",
            "console.log('bye'); process.exit(0); console.log('unreachable');",
        ));
        assert!(ok.is_ok());
        assert_eq!(contents(&console), vec!["bye"]);

        let (failed, _console) = run(ScriptSource::inline(
            "main",
            "setTimeout(() => process.exit(3), 5)",
        ));
        assert!(failed
            .unwrap_err()
            .to_string()
            .contains("exited with code 3"));
    }

    #[test]
    fn test_missing_import() {
        let dir = TempDir::new().unwrap();
        let main = write(dir.path(), "main.mjs", "import x from './missing.mjs'; x;");
        let (result, _console) = run(ScriptSource::from_file(main));
        assert!(matches!(result, Err(EngineError::ScriptExecution(_))));
    }

    #[test]
    fn test_module_dir_lookup() {
        let shared = TempDir::new().unwrap();
        write(shared.path(), "helpers.mjs", "export default 'shared';");
        let work = TempDir::new().unwrap();
        let main = write(
            work.path(),
            "main.mjs",
            "import helper from 'helpers'; export default helper;",
        );

        let console = Console::new("test");
        let mut options = EngineOptions::new(console);
        options.settings.module_dir = Some(shared.path().to_path_buf());
        let mut engine = NodeEngine::new(options);
        assert_eq!(
            engine.execute(&ScriptSource::from_file(main)).unwrap(),
            json!("shared")
        );
    }
}
