// src/runtime/js_context.rs
//! QuickJS context shared by both engine flavours
//!
//! [`JsContext`] owns one QuickJS runtime and context, installs the host
//! bridge (console, timers, `sleep`, `host.call`, `require`) and drives the
//! event loop: pending jobs first, then due timers, sleeping on the
//! engine's [`StopHandle`] until the next deadline.
//!
//! [`EngineCore`] holds the lifecycle bookkeeping common to
//! [`ClassicEngine`](super::ClassicEngine) and
//! [`NodeEngine`](super::NodeEngine).

use crate::console::{Console, LogEntry, LogLevel, LogListener};
use crate::runtime::capabilities::{CallContext, CapabilityTable};
use crate::runtime::engine::{EngineState, StopHandle};
use crate::runtime::execution_config::{ExecutionConfig, LoopMode};
use crate::runtime::module_resolver::{FsLoader, FsResolver, ModuleResolver};
use crate::runtime::script_source::{LoadedScript, ScriptSource};
use crate::runtime::EngineKind;
use crate::utils::config::EngineSettings;
use crate::utils::errors::{EngineError, Result, ScriptFailure};
use parking_lot::Mutex;
use rquickjs::function::IntoArgs;
use rquickjs::{Coerced, Context, Ctx, Exception, FromJs, Function, Module, Object, Runtime};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const PRELUDE: &str = include_str!("prelude.js");

/// Everything an engine needs from its host
#[derive(Clone)]
pub struct EngineOptions {
    pub settings: EngineSettings,
    pub config: ExecutionConfig,
    pub console: Arc<Console>,
    pub capabilities: Arc<CapabilityTable>,

    /// Task id forwarded to capability calls
    pub task_id: Option<u64>,
}

impl EngineOptions {
    pub fn new(console: Arc<Console>) -> Self {
        Self {
            settings: EngineSettings::default(),
            config: ExecutionConfig::default(),
            console,
            capabilities: Arc::new(CapabilityTable::with_builtins()),
            task_id: None,
        }
    }

    /// Directory used for capability paths and inline sources
    pub fn working_dir(&self) -> PathBuf {
        self.config
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Turn a failed QuickJS call into an engine error, reading the pending
/// exception from `ctx`
pub(crate) fn fault(ctx: &Ctx<'_>, err: rquickjs::Error) -> EngineError {
    match err {
        rquickjs::Error::Exception => EngineError::ScriptExecution(failure_from(ctx, ctx.catch())),
        other => EngineError::script(other.to_string()),
    }
}

/// Describe a thrown value
pub(crate) fn failure_from<'js>(ctx: &Ctx<'js>, value: rquickjs::Value<'js>) -> ScriptFailure {
    if let Some(obj) = value.as_object() {
        if let Some(exception) = Exception::from_object(obj.clone()) {
            let name = obj
                .get::<_, Option<Coerced<String>>>("name")
                .ok()
                .flatten()
                .map(|n| n.0)
                .unwrap_or_else(|| "Error".to_string());
            let message = match exception.message() {
                Some(m) if !m.is_empty() => format!("{}: {}", name, m),
                _ => name,
            };
            return ScriptFailure::new(message).with_stack(exception.stack());
        }
    }
    match Coerced::<String>::from_js(ctx, value) {
        Ok(text) => ScriptFailure::new(format!("Uncaught {}", text.0)),
        Err(err) => ScriptFailure::new(format!("Uncaught exception ({})", err)),
    }
}

fn throw(ctx: &Ctx<'_>, err: EngineError) -> rquickjs::Error {
    Exception::throw_message(ctx, &err.to_string())
}

/// Raised from host functions once the run is halted so that no side
/// effect happens after a stop, an exit or the deadline
fn halted(ctx: &Ctx<'_>) -> rquickjs::Error {
    Exception::throw_internal(ctx, "interrupted")
}

fn autox_call<'js, A, R>(ctx: &Ctx<'js>, name: &str, args: A) -> rquickjs::Result<R>
where
    A: IntoArgs<'js>,
    R: FromJs<'js>,
{
    let autox: Object = ctx.globals().get("__autox")?;
    let function: Function = autox.get(name)?;
    function.call(args)
}

/// Host state captured by the bridge functions
struct Bridge {
    console: Arc<Console>,
    capabilities: Arc<CapabilityTable>,
    resolver: ModuleResolver,
    working_dir: PathBuf,
    task_id: Option<u64>,
    stop: Arc<StopHandle>,
    started: Instant,
}

/// One QuickJS runtime + context with the host bridge installed
pub struct JsContext {
    context: Context,
    runtime: Runtime,
    stop: Arc<StopHandle>,
    started: Instant,
    timeout: Option<Duration>,
}

impl JsContext {
    fn new(
        settings: &EngineSettings,
        bridge: Bridge,
        es_modules: bool,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let init_error = |e: rquickjs::Error| EngineError::EngineInit(e.to_string());

        let runtime = Runtime::new().map_err(init_error)?;
        if settings.memory_limit_mb > 0 {
            runtime.set_memory_limit(settings.memory_limit_mb * 1024 * 1024);
        }
        if settings.max_stack_kb > 0 {
            runtime.set_max_stack_size(settings.max_stack_kb * 1024);
        }

        let interrupt = Arc::clone(&bridge.stop);
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.should_interrupt())));

        if es_modules {
            runtime.set_loader(FsResolver::new(bridge.resolver.clone()), FsLoader);
        }

        let context = Context::full(&runtime).map_err(init_error)?;
        let stop = Arc::clone(&bridge.stop);
        let started = bridge.started;

        context.with(|ctx| {
            install_bridge(&ctx, bridge)
                .and_then(|_| ctx.eval::<(), _>(PRELUDE))
                .map_err(|e| match fault(&ctx, e) {
                    EngineError::ScriptExecution(f) => EngineError::EngineInit(f.detailed()),
                    other => EngineError::EngineInit(other.to_string()),
                })
        })?;

        Ok(Self {
            context,
            runtime,
            stop,
            started,
            timeout,
        })
    }

    /// Run `f` inside the context
    pub(crate) fn with<R>(&self, f: impl FnOnce(Ctx<'_>) -> Result<R>) -> Result<R> {
        self.context.with(f)
    }

    /// Call a function of the prelude control surface
    pub(crate) fn call<A, R>(&self, name: &str, args: A) -> Result<R>
    where
        A: for<'js> IntoArgs<'js>,
        R: for<'js> FromJs<'js>,
    {
        self.with(|ctx| autox_call(&ctx, name, args).map_err(|e| fault(&ctx, e)))
    }

    fn now_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    /// Evaluate `code` as a global script and serialize its value
    pub(crate) fn eval_script(&self, code: &str) -> Result<serde_json::Value> {
        self.with(|ctx| {
            let value = ctx
                .eval::<rquickjs::Value, _>(code)
                .map_err(|e| fault(&ctx, e))?;
            let json: Option<String> =
                autox_call(&ctx, "serialize", (value,)).map_err(|e| fault(&ctx, e))?;
            Ok(parse_json(json))
        })
    }

    /// Evaluate `code` as a global script and track its value as the
    /// run's outcome, awaiting it when it is a promise
    pub(crate) fn eval_script_tracked(&self, code: &str) -> Result<()> {
        self.with(|ctx| {
            let value = ctx
                .eval::<rquickjs::Value, _>(code)
                .map_err(|e| fault(&ctx, e))?;
            autox_call::<_, ()>(&ctx, "track", (value,)).map_err(|e| fault(&ctx, e))
        })
    }

    /// Evaluate `code` as the CommonJS entry module `filename`, tracking
    /// `module.exports`
    pub(crate) fn eval_commonjs(&self, filename: &str, code: &str) -> Result<()> {
        self.with(|ctx| {
            let run = || -> rquickjs::Result<()> {
                let exports: rquickjs::Value = autox_call(&ctx, "runMain", (filename, code))?;
                autox_call(&ctx, "track", (exports,))
            };
            run().map_err(|e| fault(&ctx, e))
        })
    }

    /// Declare and evaluate an ES module, tracking its default export
    pub(crate) fn eval_module(&self, name: &str, code: &str) -> Result<()> {
        self.with(|ctx| {
            let run = || -> rquickjs::Result<()> {
                let declared = Module::declare(ctx.clone(), name, code)?;
                let (module, evaluation) = declared.eval()?;
                let namespace = module.namespace()?;
                autox_call(&ctx, "trackModule", (evaluation, namespace))
            };
            run().map_err(|e| fault(&ctx, e))
        })
    }

    /// Settled value of the tracked outcome
    pub(crate) fn outcome(&self) -> Result<serde_json::Value> {
        match self.call::<_, String>("outcomeState", ())?.as_str() {
            "fulfilled" => Ok(parse_json(self.call::<_, Option<String>>("outcomeJson", ())?)),
            "rejected" => Err(self.rejection()),
            "pending" => Err(EngineError::script("Top-level promise never settled")),
            _ => Ok(serde_json::Value::Null),
        }
    }

    fn rejection(&self) -> EngineError {
        self.with(|ctx| {
            let error = autox_call::<_, rquickjs::Value>(&ctx, "outcomeError", ())
                .map_err(|e| fault(&ctx, e))?;
            Ok(EngineError::ScriptExecution(failure_from(&ctx, error)))
        })
        .unwrap_or_else(|e| e)
    }

    /// Run pending jobs until the queue is empty or the run is halted
    fn drain_jobs(&self) -> Result<()> {
        while !self.stop.should_interrupt() {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(job) => {
                    let failure = job.0.with(|ctx| failure_from(&ctx, ctx.catch()));
                    return Err(EngineError::ScriptExecution(failure));
                }
            }
        }
        Ok(())
    }

    /// Drive jobs and timers until the script is idle. With
    /// `await_outcome`, a rejected tracked outcome fails the run as soon
    /// as it is observed.
    pub(crate) fn run_loop(&self, mode: LoopMode, await_outcome: bool) -> Result<()> {
        loop {
            self.drain_jobs()?;

            if self.stop.is_interrupted() {
                return Err(EngineError::EngineTerminated);
            }
            if self.stop.exit_code().is_some() {
                return Ok(());
            }
            if self.stop.check_deadline() {
                return Err(self.timeout_error());
            }
            if await_outcome && self.call::<_, String>("outcomeState", ())? == "rejected" {
                return Err(self.rejection());
            }

            if mode == LoopMode::Once {
                self.call::<_, ()>("clearTimers", ())?;
                return Ok(());
            }

            if self.call::<_, bool>("runDue", ())? {
                continue;
            }

            let next = self.call::<_, f64>("nextDeadline", ())?;
            if next < 0.0 {
                if self.runtime.is_job_pending() {
                    continue;
                }
                return Ok(());
            }

            let wait = next - self.now_ms();
            if wait > 0.0 {
                self.stop.sleep(Duration::from_secs_f64(wait / 1000.0));
            }
        }
    }

    fn timeout_error(&self) -> EngineError {
        EngineError::ExecutionTimeout(self.timeout.unwrap_or_default())
    }

    /// Map the raw result of a run onto the stop / exit / timeout state
    pub(crate) fn conclude(&self, result: Result<serde_json::Value>) -> Result<serde_json::Value> {
        if result.is_err() && self.stop.is_interrupted() {
            return Err(EngineError::EngineTerminated);
        }
        if let Some(code) = self.stop.exit_code() {
            return match code {
                0 => Ok(result.unwrap_or(serde_json::Value::Null)),
                code => Err(EngineError::script(format!(
                    "Process exited with code {}",
                    code
                ))),
            };
        }
        match result {
            Err(_) if self.stop.timed_out() => Err(self.timeout_error()),
            other => other,
        }
    }
}

fn parse_json(text: Option<String>) -> serde_json::Value {
    text.and_then(|t| serde_json::from_str(&t).ok())
        .unwrap_or(serde_json::Value::Null)
}

fn install_bridge(ctx: &Ctx<'_>, bridge: Bridge) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    let Bridge {
        console,
        capabilities,
        resolver,
        working_dir,
        task_id,
        stop,
        started,
    } = bridge;

    {
        let console = Arc::clone(&console);
        let stop = Arc::clone(&stop);
        globals.set(
            "__console_print",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, level: i32, text: String| -> rquickjs::Result<()> {
                    if stop.is_halted() {
                        return Err(halted(&ctx));
                    }
                    console.println(LogLevel::from_priority(level), text);
                    Ok(())
                },
            )?,
        )?;
    }
    {
        let console = Arc::clone(&console);
        let stop = Arc::clone(&stop);
        globals.set(
            "__console_clear",
            Function::new(ctx.clone(), move |ctx: Ctx<'_>| -> rquickjs::Result<()> {
                if stop.is_halted() {
                    return Err(halted(&ctx));
                }
                console.clear();
                Ok(())
            })?,
        )?;
    }
    {
        let console = Arc::clone(&console);
        let stop = Arc::clone(&stop);
        globals.set(
            "__console_raw_input",
            Function::new(ctx.clone(), move |ctx: Ctx<'_>| -> rquickjs::Result<String> {
                if stop.is_halted() {
                    return Err(halted(&ctx));
                }
                match console.raw_input(&|| stop.is_halted()) {
                    Ok(text) => Ok(text),
                    Err(EngineError::EngineTerminated) => Err(halted(&ctx)),
                    Err(e) => Err(throw(&ctx, e)),
                }
            })?,
        )?;
    }

    globals.set(
        "__autox_now",
        Function::new(ctx.clone(), move || started.elapsed().as_secs_f64() * 1000.0)?,
    )?;
    {
        let stop = Arc::clone(&stop);
        globals.set(
            "__autox_sleep",
            Function::new(ctx.clone(), move |ctx: Ctx<'_>, ms: f64| -> rquickjs::Result<()> {
                let ms = if ms > 0.0 { ms.min(u32::MAX as f64) } else { 0.0 };
                if stop.sleep(Duration::from_secs_f64(ms / 1000.0)) && !stop.is_halted() {
                    Ok(())
                } else {
                    Err(halted(&ctx))
                }
            })?,
        )?;
    }
    {
        let stop = Arc::clone(&stop);
        globals.set(
            "__autox_exit",
            Function::new(ctx.clone(), move |ctx: Ctx<'_>, code: i32| -> rquickjs::Result<()> {
                debug!("Script requested exit with code {}", code);
                stop.request_exit(code);
                Err(Exception::throw_internal(&ctx, "exit"))
            })?,
        )?;
    }

    {
        let stop = Arc::clone(&stop);
        globals.set(
            "__autox_host_call",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, name: String, args: String| -> rquickjs::Result<String> {
                    if stop.is_halted() {
                        return Err(halted(&ctx));
                    }
                    let args: Vec<serde_json::Value> = serde_json::from_str(&args).map_err(|e| {
                        throw(&ctx, EngineError::script(format!("Invalid host call arguments: {}", e)))
                    })?;
                    let cx = CallContext {
                        working_dir: &working_dir,
                        task_id,
                    };
                    capabilities
                        .call(&name, &cx, &args)
                        .and_then(|value| Ok(serde_json::to_string(&value)?))
                        .map_err(|e| throw(&ctx, e))
                },
            )?,
        )?;
    }

    globals.set(
        "__autox_resolve",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'_>, dir: String, specifier: String| -> rquickjs::Result<String> {
                resolver
                    .resolve(Path::new(&dir), &specifier)
                    .map(|path| path.to_string_lossy().into_owned())
                    .map_err(|e| throw(&ctx, e))
            },
        )?,
    )?;
    globals.set(
        "__autox_read",
        Function::new(ctx.clone(), move |ctx: Ctx<'_>, path: String| -> rquickjs::Result<String> {
            fs::read_to_string(&path).map_err(|e| {
                throw(&ctx, EngineError::InvalidSource(format!("{}: {}", path, e)))
            })
        })?,
    )?;

    Ok(())
}

/// Collects error-level console lines emitted during a run
#[derive(Default)]
struct ErrorCollector {
    lines: Mutex<Vec<String>>,
}

impl LogListener for ErrorCollector {
    fn on_new_log(&self, entry: &LogEntry) {
        if entry.level >= LogLevel::Error {
            self.lines.lock().push(entry.content.clone());
        }
    }
}

/// Lifecycle bookkeeping shared by the engine flavours
pub(crate) struct EngineCore {
    kind: EngineKind,
    options: EngineOptions,
    stop: Arc<StopHandle>,
    tags: BTreeMap<String, serde_json::Value>,
    js: Option<JsContext>,
}

impl EngineCore {
    pub(crate) fn new(kind: EngineKind, options: EngineOptions) -> Self {
        let tags = options.config.tags.clone();
        Self {
            kind,
            options,
            stop: StopHandle::new(),
            tags,
            js: None,
        }
    }

    pub(crate) fn kind(&self) -> EngineKind {
        self.kind
    }

    pub(crate) fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub(crate) fn stop_handle(&self) -> Arc<StopHandle> {
        Arc::clone(&self.stop)
    }

    pub(crate) fn state(&self) -> EngineState {
        self.stop.state()
    }

    pub(crate) fn init(&mut self, resolver: ModuleResolver, es_modules: bool) -> Result<()> {
        match self.state() {
            EngineState::Created => {}
            EngineState::Destroyed => {
                return Err(EngineError::IllegalState("engine has been destroyed".into()))
            }
            state => {
                return Err(EngineError::IllegalState(format!(
                    "engine already initialized ({:?})",
                    state
                )))
            }
        }

        let bridge = Bridge {
            console: Arc::clone(&self.options.console),
            capabilities: Arc::clone(&self.options.capabilities),
            resolver,
            working_dir: self.options.working_dir(),
            task_id: self.options.task_id,
            stop: Arc::clone(&self.stop),
            started: Instant::now(),
        };

        match JsContext::new(
            &self.options.settings,
            bridge,
            es_modules,
            self.options.config.timeout(),
        ) {
            Ok(js) => {
                self.js = Some(js);
                self.stop.set_state(EngineState::Initialized);

                // Wake a script blocked on console input when stopped
                let console = Arc::clone(&self.options.console);
                self.stop.on_exit(move || console.wake_input());

                debug!("{:?} engine initialized", self.kind);
                Ok(())
            }
            Err(err) => {
                warn!("{:?} engine failed to initialize: {}", self.kind, err);
                self.stop.set_state(EngineState::Failed);
                Err(err)
            }
        }
    }

    pub(crate) fn put(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        match self.state() {
            EngineState::Created | EngineState::Initialized => {
                self.tags.insert(key.to_string(), value);
                Ok(())
            }
            state => Err(EngineError::IllegalState(format!(
                "cannot set tag '{}' in state {:?}",
                key, state
            ))),
        }
    }

    /// Run `source` through `run`, handling state transitions, the
    /// deadline and failure reporting
    pub(crate) fn execute<F>(&mut self, source: &ScriptSource, run: F) -> Result<serde_json::Value>
    where
        F: FnOnce(&JsContext, &LoadedScript, &EngineOptions) -> Result<serde_json::Value>,
    {
        match self.state() {
            EngineState::Initialized => {}
            EngineState::Destroyed => {
                return Err(EngineError::IllegalState("engine has been destroyed".into()))
            }
            EngineState::Created => {
                return Err(EngineError::IllegalState("engine is not initialized".into()))
            }
            state => {
                return Err(EngineError::IllegalState(format!(
                    "engine already ran a source ({:?})",
                    state
                )))
            }
        }
        let js = self
            .js
            .as_ref()
            .ok_or_else(|| EngineError::IllegalState("engine is not initialized".into()))?;

        if self.stop.is_interrupted() {
            self.stop.set_state(EngineState::Stopped);
            return Err(EngineError::EngineTerminated);
        }

        self.stop.set_state(EngineState::Running);
        self.stop.arm_deadline(self.options.config.timeout());
        debug!("{:?} engine executing {}", self.kind, source.identity());

        let console = &self.options.console;
        let collector = Arc::new(ErrorCollector::default());
        let subscription = console.subscribe(collector.clone());

        let tags = serde_json::to_string(&self.tags)?;
        let kind = self.kind.as_str();
        let raw = source.load().and_then(|loaded| {
            js.call::<_, ()>("installEngine", (kind, tags))?;
            run(js, &loaded, &self.options)
        });
        let result = js.conclude(raw);
        drop(subscription);

        let result = match result {
            Err(EngineError::ScriptExecution(mut failure)) => {
                failure.console_errors = std::mem::take(&mut *collector.lines.lock());
                console.error(failure.detailed());
                Err(EngineError::ScriptExecution(failure))
            }
            Err(err @ (EngineError::ExecutionTimeout(_) | EngineError::InvalidSource(_))) => {
                console.error(err.to_string());
                Err(err)
            }
            other => other,
        };

        self.stop.set_state(match &result {
            Ok(_) => EngineState::Completed,
            Err(EngineError::EngineTerminated) => EngineState::Stopped,
            Err(_) => EngineState::Failed,
        });
        result
    }

    pub(crate) fn destroy(&mut self) {
        if self.state() == EngineState::Destroyed {
            return;
        }
        if let Some(js) = self.js.take() {
            drop(js);
            debug!("{:?} engine released its interpreter", self.kind);
        }
        self.stop.set_state(EngineState::Destroyed);
    }
}

impl Drop for EngineCore {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Node-style `process` description handed to the prelude
pub(crate) fn process_info(options: &EngineOptions, script: &LoadedScript) -> Result<String> {
    let working_dir = options.working_dir();
    let mut env: BTreeMap<String, String> = std::env::vars().collect();
    env.extend(options.config.env.clone());

    let mut argv = vec![
        "autox".to_string(),
        script.module_name(&working_dir),
    ];
    argv.extend(options.config.argv.iter().cloned());

    let platform = match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    };

    Ok(serde_json::to_string(&serde_json::json!({
        "argv": argv,
        "env": env,
        "platform": platform,
        "cwd": working_dir.to_string_lossy(),
    }))?)
}
