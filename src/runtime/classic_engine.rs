// src/runtime/classic_engine.rs
//! Classic (AutoJs style) engine
//!
//! Evaluates the source as a global script. `require()` accepts relative
//! paths only, the completion value is returned as-is and pending timers
//! keep the script alive until they drain.

use crate::runtime::engine::{EngineState, ScriptEngine, StopHandle};
use crate::runtime::js_context::{EngineCore, EngineOptions};
use crate::runtime::module_resolver::ModuleResolver;
use crate::runtime::script_source::{ModuleKind, ScriptSource};
use crate::runtime::EngineKind;
use crate::utils::errors::{EngineError, Result};
use std::sync::Arc;

pub struct ClassicEngine {
    core: EngineCore,
}

impl ClassicEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            core: EngineCore::new(EngineKind::Classic, options),
        }
    }
}

impl ScriptEngine for ClassicEngine {
    fn kind(&self) -> EngineKind {
        self.core.kind()
    }

    fn state(&self) -> EngineState {
        self.core.state()
    }

    fn init(&mut self) -> Result<()> {
        self.core.init(ModuleResolver::relative_only(), false)
    }

    fn put(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        self.core.put(key, value)
    }

    fn execute(&mut self, source: &ScriptSource) -> Result<serde_json::Value> {
        if self.core.state() == EngineState::Created {
            self.init()?;
        }
        self.core.execute(source, |js, script, options| {
            if script.kind == ModuleKind::EsModule {
                return Err(EngineError::InvalidSource(format!(
                    "{} is an ES module; run it with the node engine",
                    script.name
                )));
            }
            let base = script.base_dir(&options.working_dir());
            js.call::<_, ()>("installRequire", (base.to_string_lossy().into_owned(),))?;

            let value = js.eval_script(&script.code)?;
            js.run_loop(options.config.loop_mode, false)?;
            Ok(value)
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
    use crate::console::{Console, LogLevel};
    use crate::runtime::execution_config::LoopMode;
    use serde_json::json;
    use std::fs;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn engine() -> (ClassicEngine, Arc<Console>) {
        let console = Console::new("test");
        (ClassicEngine::new(EngineOptions::new(Arc::clone(&console))), console)
    }

    fn contents(console: &Console) -> Vec<String> {
        console.entries().into_iter().map(|e| e.content).collect()
    }

    #[test]
    fn test_hello_and_value() {
        let (mut engine, console) = engine();
        let value = engine
            .execute(&ScriptSource::inline("main", "console.log('hi'); 1+1"))
            .unwrap();
        assert_eq!(value, json!(2));
        assert_eq!(contents(&console), vec!["hi"]);
        assert_eq!(engine.state(), EngineState::Completed);
    }

    #[test]
    fn test_console_levels_and_format() {
        let (mut engine, console) = engine();
        engine
            .execute(&ScriptSource::inline(
                "main",
                "console.warn('%s has %d items', 'cart', 3); console.info({a: 1});",
            ))
            .unwrap();
        let entries = console.entries();
        assert_eq!(entries[0].level, LogLevel::Warn);
        assert_eq!(entries[0].content, "cart has 3 items");
        assert_eq!(entries[1].level, LogLevel::Info);
        assert_eq!(entries[1].content, r#"{"a":1}"#);
    }

    #[test]
    fn test_uncaught_exception() {
        let (mut engine, console) = engine();
        let err = engine
            .execute(&ScriptSource::inline(
                "main",
                "console.error('about to fail'); throw new Error('boom')",
            ))
            .unwrap_err();

        match err {
            EngineError::ScriptExecution(failure) => {
                assert_eq!(failure.message, "Error: boom");
                assert_eq!(failure.console_errors, vec!["about to fail".to_string()]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(engine.state(), EngineState::Failed);
        assert!(console.error_lines().iter().any(|l| l.contains("boom")));
    }

    #[test]
    fn test_thrown_string() {
        let (mut engine, _console) = engine();
        let err = engine
            .execute(&ScriptSource::inline("main", "throw 'plain'"))
            .unwrap_err();
        assert!(err.to_string().contains("plain"));
    }

    #[test]
    fn test_timers_run_in_deadline_order() {
        let (mut engine, console) = engine();
        engine
            .execute(&ScriptSource::inline(
                "main",
                r#"
                setTimeout(() => console.log('late'), 30);
                setTimeout(() => console.log('early'), 10);
                setTimeout(() => console.log('same-1'), 20);
                setTimeout(() => console.log('same-2'), 20);
                const id = setTimeout(() => console.log('cancelled'), 5);
                clearTimeout(id);
                Promise.resolve().then(() => console.log('microtask'));
                "#,
            ))
            .unwrap();
        assert_eq!(
            contents(&console),
            vec!["microtask", "early", "same-1", "same-2", "late"]
        );
    }

    #[test]
    fn test_interval_until_cleared() {
        let (mut engine, console) = engine();
        engine
            .execute(&ScriptSource::inline(
                "main",
                r#"
                let n = 0;
                const id = setInterval(() => {
                    n++;
                    console.log('tick ' + n);
                    if (n === 3) clearInterval(id);
                }, 5);
                "#,
            ))
            .unwrap();
        assert_eq!(contents(&console), vec!["tick 1", "tick 2", "tick 3"]);
    }

    #[test]
    fn test_loop_once_drops_timers() {
        let console = Console::new("test");
        let mut options = EngineOptions::new(Arc::clone(&console));
        options.config.loop_mode = LoopMode::Once;
        let mut engine = ClassicEngine::new(options);
        engine
            .execute(&ScriptSource::inline(
                "main",
                "setTimeout(() => console.log('never'), 10); console.log('now')",
            ))
            .unwrap();
        assert_eq!(contents(&console), vec!["now"]);
    }

    #[test]
    fn test_timer_exception_fails_run() {
        let (mut engine, _console) = engine();
        let err = engine
            .execute(&ScriptSource::inline(
                "main",
                "setTimeout(() => { throw new TypeError('late failure') }, 1)",
            ))
            .unwrap_err();
        assert!(err.to_string().contains("TypeError: late failure"));
    }

    #[test]
    fn test_promise_not_awaited() {
        let (mut engine, _console) = engine();
        let value = engine
            .execute(&ScriptSource::inline("main", "Promise.reject(new Error('ignored'))"))
            .unwrap();
        assert_eq!(value, json!({}));
    }

    #[test]
    fn test_relative_require() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("math.js"),
            "module.exports = { add: (a, b) => a + b };",
        )
        .unwrap();
        fs::write(
            dir.path().join("main.js"),
            "const math = require('./math'); math.add(2, 3)",
        )
        .unwrap();

        let (mut engine, _console) = engine();
        let value = engine
            .execute(&ScriptSource::from_file(dir.path().join("main.js")))
            .unwrap();
        assert_eq!(value, json!(5));
    }

    #[test]
    fn test_bare_require_rejected() {
        let (mut engine, _console) = engine();
        let err = engine
            .execute(&ScriptSource::inline("main", "require('left-pad')"))
            .unwrap_err();
        assert!(err.to_string().contains("Cannot find module 'left-pad'"));
    }

    #[test]
    fn test_es_module_rejected() {
        let (mut engine, _console) = engine();
        let source = ScriptSource::inline("main.mjs", "export default 1")
            .with_kind(ModuleKind::EsModule);
        assert!(matches!(
            engine.execute(&source),
            Err(EngineError::InvalidSource(_))
        ));
    }

    #[test]
    fn test_tags_visible_and_frozen_after_start() {
        let (mut engine, _console) = engine();
        engine.put("retries", json!(3)).unwrap();
        let value = engine
            .execute(&ScriptSource::inline("main", "engine.tags.retries * 2"))
            .unwrap();
        assert_eq!(value, json!(6));
        assert!(matches!(
            engine.put("late", json!(true)),
            Err(EngineError::IllegalState(_))
        ));
    }

    #[test]
    fn test_lifecycle_contract() {
        let (mut engine, _console) = engine();
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.force_stop());

        engine.init().unwrap();
        assert!(matches!(engine.init(), Err(EngineError::IllegalState(_))));

        engine.destroy();
        engine.destroy();
        assert_eq!(engine.state(), EngineState::Destroyed);
        assert!(!engine.force_stop());
        assert!(matches!(
            engine.execute(&ScriptSource::inline("main", "1")),
            Err(EngineError::IllegalState(_))
        ));
    }

    #[test]
    fn test_one_source_per_engine() {
        let (mut engine, _console) = engine();
        engine.execute(&ScriptSource::inline("a", "1")).unwrap();
        assert!(matches!(
            engine.execute(&ScriptSource::inline("b", "2")),
            Err(EngineError::IllegalState(_))
        ));
    }

    fn run_in_thread(
        code: &'static str,
        options: impl FnOnce(&mut EngineOptions) + Send + 'static,
    ) -> (Arc<StopHandle>, thread::JoinHandle<Result<serde_json::Value>>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let worker = thread::spawn(move || {
            let mut opts = EngineOptions::new(Console::new("worker"));
            options(&mut opts);
            let mut engine = ClassicEngine::new(opts);
            engine.init()?;
            let _ = tx.send(engine.stop_handle());
            engine.execute(&ScriptSource::inline("main", code))
        });
        (rx.recv().unwrap(), worker)
    }

    #[test]
    fn test_force_stop_busy_loop() {
        let (handle, worker) = run_in_thread("while (true) {}", |_| {});
        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        assert!(handle.force_stop());
        assert!(matches!(
            worker.join().unwrap(),
            Err(EngineError::EngineTerminated)
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(handle.state(), EngineState::Stopped);
    }

    #[test]
    fn test_force_stop_wakes_sleep_and_timers() {
        let (handle, worker) = run_in_thread(
            "setTimeout(() => {}, 60000); sleep(60000);",
            |_| {},
        );
        thread::sleep(Duration::from_millis(100));
        handle.force_stop();
        assert!(matches!(
            worker.join().unwrap(),
            Err(EngineError::EngineTerminated)
        ));
    }

    #[test]
    fn test_force_stop_not_catchable() {
        let (handle, worker) = run_in_thread(
            "while (true) { try { while (true) {} } catch (e) {} }",
            |_| {},
        );
        thread::sleep(Duration::from_millis(50));
        handle.force_stop();
        assert!(matches!(
            worker.join().unwrap(),
            Err(EngineError::EngineTerminated)
        ));
    }

    #[test]
    fn test_no_side_effects_after_stop() {
        let dir = TempDir::new().unwrap();
        let console = Console::new("worker");
        let (tx, rx) = crossbeam_channel::bounded(1);
        let worker = {
            let console = Arc::clone(&console);
            let working_dir = dir.path().to_path_buf();
            thread::spawn(move || {
                let mut opts = EngineOptions::new(console);
                opts.config.working_dir = Some(working_dir);
                let mut engine = ClassicEngine::new(opts);
                engine.init()?;
                let _ = tx.send(engine.stop_handle());
                engine.execute(&ScriptSource::inline(
                    "main",
                    r#"
                    console.log('before');
                    try { sleep(3000); } catch (e) {}
                    console.log('after-stop');
                    host.call('files.write', 'after.txt', 'written');
                    "#,
                ))
            })
        };

        let handle = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(handle.force_stop());
        assert!(matches!(
            worker.join().unwrap(),
            Err(EngineError::EngineTerminated)
        ));
        assert_eq!(contents(&console), vec!["before"]);
        assert!(!dir.path().join("after.txt").exists());
    }

    #[test]
    fn test_stopped_promise_jobs_do_not_log() {
        let console = Console::new("worker");
        let (tx, rx) = crossbeam_channel::bounded(1);
        let worker = {
            let console = Arc::clone(&console);
            thread::spawn(move || {
                let mut engine = ClassicEngine::new(EngineOptions::new(console));
                engine.init()?;
                let _ = tx.send(engine.stop_handle());
                engine.execute(&ScriptSource::inline(
                    "main",
                    r#"
                    Promise.resolve().then(() => { try { sleep(3000); } catch (e) {} });
                    for (let i = 0; i < 1000; i++) Promise.resolve(i).then(v => console.log('job ' + v));
                    "#,
                ))
            })
        };

        let handle = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(100));
        handle.force_stop();
        assert!(worker.join().unwrap().is_err());
        assert!(console.is_empty());
    }

    #[test]
    fn test_timeout() {
        let (_handle, worker) = run_in_thread("while (true) {}", |opts| {
            opts.config.timeout_ms = Some(100);
        });
        assert!(matches!(
            worker.join().unwrap(),
            Err(EngineError::ExecutionTimeout(d)) if d == Duration::from_millis(100)
        ));
    }

    #[test]
    fn test_exit_ends_run_successfully() {
        let (mut engine, console) = engine();
        engine
            .execute(&ScriptSource::inline(
                "main",
                "console.log('before'); exit(); console.log('after');",
            ))
            .unwrap();
        assert_eq!(contents(&console), vec!["before"]);
    }

    #[test]
    fn test_host_call() {
        let dir = TempDir::new().unwrap();
        let console = Console::new("test");
        let mut options = EngineOptions::new(Arc::clone(&console));
        options.config.working_dir = Some(dir.path().to_path_buf());
        let mut engine = ClassicEngine::new(options);

        let value = engine
            .execute(&ScriptSource::inline(
                "main",
                r#"
                host.call('files.write', 'note.txt', 'saved');
                host.call('clip.set', 'copied');
                [host.call('files.read', 'note.txt'), host.call('clip.get')]
                "#,
            ))
            .unwrap();
        assert_eq!(value, json!(["saved", "copied"]));

        let err = ClassicEngine::new(EngineOptions::new(console))
            .execute(&ScriptSource::inline("main", "host.call('nope')"))
            .unwrap_err();
        assert!(err.to_string().contains("Unknown host capability"));
    }

    #[test]
    fn test_raw_input() {
        let console = Console::new("test");
        console.attach_input_surface(true);
        let feeder = {
            let console = Arc::clone(&console);
            thread::spawn(move || {
                while !console.submit_input("42") {
                    thread::sleep(Duration::from_millis(5));
                }
            })
        };

        let mut engine = ClassicEngine::new(EngineOptions::new(Arc::clone(&console)));
        let value = engine
            .execute(&ScriptSource::inline(
                "main",
                "Number(console.rawInput('number?')) + 1",
            ))
            .unwrap();
        feeder.join().unwrap();
        assert_eq!(value, json!(43));
        assert_eq!(console.entries()[0].content, "number?");
    }
}
