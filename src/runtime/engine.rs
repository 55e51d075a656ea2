// src/runtime/engine.rs
//! Engine abstraction and cross-thread stop handle
//!
//! An engine owns one interpreter and runs one source at a time on the
//! thread that created it. Everything another thread may need (reading the
//! lifecycle state, forcing a stop) goes through the engine's
//! [`StopHandle`], which is `Send + Sync`.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──init──▶ Initialized ──execute──▶ Running ──▶ Completed
//!    │                   │                      ├──────▶ Failed
//!    │                   │                      └──────▶ Stopped
//!    └───────────────────┴──────────destroy─────────────▶ Destroyed
//! ```

use crate::runtime::script_source::ScriptSource;
use crate::runtime::EngineKind;
use crate::utils::errors::Result;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EngineState {
    Created = 0,
    Initialized = 1,
    Running = 2,
    Completed = 3,
    Failed = 4,
    Stopped = 5,
    Destroyed = 6,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Created,
            1 => EngineState::Initialized,
            2 => EngineState::Running,
            3 => EngineState::Completed,
            4 => EngineState::Failed,
            5 => EngineState::Stopped,
            _ => EngineState::Destroyed,
        }
    }

    /// Whether `execute` has finished (successfully or not)
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            EngineState::Completed | EngineState::Failed | EngineState::Stopped
        )
    }
}

/// A script engine
///
/// Implementations are not `Send`: an engine is created, used and
/// destroyed on a single worker thread.
pub trait ScriptEngine {
    fn kind(&self) -> EngineKind;

    fn state(&self) -> EngineState {
        self.stop_handle().state()
    }

    /// Allocate the interpreter and install the host bridge
    fn init(&mut self) -> Result<()>;

    /// Store a tag visible to the script as `engine.tags[key]`
    fn put(&mut self, key: &str, value: serde_json::Value) -> Result<()>;

    /// Run `source` to completion and return its settled value
    fn execute(&mut self, source: &ScriptSource) -> Result<serde_json::Value>;

    /// Handle that other threads use to stop this engine
    fn stop_handle(&self) -> Arc<StopHandle>;

    fn force_stop(&self) -> bool {
        self.stop_handle().force_stop()
    }

    /// Release the interpreter; safe to call more than once
    fn destroy(&mut self);
}

type ExitHook = Box<dyn FnOnce() + Send>;

/// Thread-safe control surface of an engine
pub struct StopHandle {
    state: AtomicU8,
    interrupted: AtomicBool,
    timed_out: AtomicBool,
    exit_requested: AtomicBool,
    exit_code: AtomicI32,
    deadline: Mutex<Option<Instant>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    exit_hooks: Mutex<Vec<ExitHook>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            state: AtomicU8::new(EngineState::Created as u8),
            interrupted: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            exit_requested: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
            deadline: Mutex::new(None),
            wake_tx,
            wake_rx,
            exit_hooks: Mutex::new(Vec::new()),
        }
    }
}

impl StopHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Request a stop: cancel timers, interrupt the interpreter, then run
    /// the exit hooks. Returns false when nothing was done (not yet
    /// initialised, already destroyed, or already stopping).
    pub fn force_stop(&self) -> bool {
        match self.state() {
            EngineState::Created | EngineState::Destroyed => return false,
            _ => {}
        }
        if self.interrupted.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!("Force stop requested in state {:?}", self.state());

        // Wakes a loop sleeping on its next timer; it drops every timer
        // once it observes the flag.
        let _ = self.wake_tx.try_send(());

        let hooks = std::mem::take(&mut *self.exit_hooks.lock());
        for hook in hooks {
            hook();
        }
        true
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Register a hook run once on the first `force_stop`
    pub fn on_exit(&self, hook: impl FnOnce() + Send + 'static) {
        if self.is_interrupted() {
            hook();
            return;
        }
        self.exit_hooks.lock().push(Box::new(hook));
    }

    /// Arm the execution deadline
    pub(crate) fn arm_deadline(&self, timeout: Option<Duration>) {
        *self.deadline.lock() = timeout.map(|t| Instant::now() + t);
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Record a script-requested exit and interrupt the interpreter
    pub(crate) fn request_exit(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
        self.exit_requested.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(());
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        self.exit_requested
            .load(Ordering::SeqCst)
            .then(|| self.exit_code.load(Ordering::SeqCst))
    }

    /// Whether the run must not touch the host any more: stopped, exited
    /// or past its deadline
    pub(crate) fn is_halted(&self) -> bool {
        self.is_interrupted() || self.exit_code().is_some() || self.check_deadline()
    }

    /// Polled by the interpreter's interrupt handler
    pub(crate) fn should_interrupt(&self) -> bool {
        if self.is_interrupted() || self.exit_requested.load(Ordering::SeqCst) {
            return true;
        }
        self.check_deadline()
    }

    /// Whether the deadline passed; latches `timed_out`
    pub(crate) fn check_deadline(&self) -> bool {
        if self.timed_out() {
            return true;
        }
        match self.deadline() {
            Some(deadline) if Instant::now() >= deadline => {
                self.timed_out.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Block for up to `duration`, waking early on stop, exit or the
    /// deadline. Returns false if the wait ended because of a stop.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut until = Instant::now() + duration;
        if let Some(deadline) = self.deadline() {
            until = until.min(deadline);
        }
        loop {
            if self.is_interrupted() || self.exit_code().is_some() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return !self.check_deadline();
            }
            // A stale wake token only shortens one wait; the flags are the
            // source of truth.
            let _ = self.wake_rx.recv_timeout(until - now);
        }
    }
}
