// src/console/console_impl.rs
//! Console sink shared by running scripts
//!
//! A console owns a bounded buffer of [`LogEntry`] values and a list of
//! subscribers. Every `println` assigns the next id, appends the entry and
//! notifies subscribers while holding a re-entrant delivery lock, so all
//! subscribers observe entries in id order even when several engines log
//! concurrently. A console may have a parent; entries are mirrored to it
//! (per-task console → global console).
//!
//! Subscribers are registered through [`Console::subscribe`], which returns
//! a [`Subscription`] handle. Dropping the handle removes the subscriber;
//! the handle only holds a weak reference to the console.

use crate::console::log_entry::{LogEntry, LogLevel};
use crate::utils::config::ConsoleSettings;
use crate::utils::errors::{EngineError, Result};
use parking_lot::{Condvar, Mutex, ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// How long `raw_input` waits for an input surface before giving up
pub const INPUT_SURFACE_TIMEOUT: Duration = Duration::from_millis(2000);

const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Behaviour once the buffer grows past `max_lines`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest entries, keeping exactly `max_lines`
    #[default]
    DropOldest,

    /// Clear the whole buffer and emit a clear event
    Clear,
}

/// Receives console events
pub trait LogListener: Send + Sync {
    fn on_new_log(&self, entry: &LogEntry);

    fn on_log_clear(&self) {}
}

/// A console event as plain data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsoleEvent {
    Log { entry: LogEntry },
    Cleared,
}

struct FnListener<F>(F);

impl<F> LogListener for FnListener<F>
where
    F: Fn(ConsoleEvent) + Send + Sync,
{
    fn on_new_log(&self, entry: &LogEntry) {
        (self.0)(ConsoleEvent::Log {
            entry: entry.clone(),
        });
    }

    fn on_log_clear(&self) {
        (self.0)(ConsoleEvent::Cleared);
    }
}

#[derive(Default)]
struct InputSlot {
    surface_attached: bool,
    waiting: bool,
    pending: Option<String>,
    closed: bool,
}

/// Bounded, multi-subscriber log buffer
pub struct Console {
    name: String,
    next_id: AtomicU64,
    buffer: Mutex<VecDeque<LogEntry>>,
    max_lines: AtomicI64,
    overflow: OverflowPolicy,
    delivery: ReentrantMutex<()>,
    listeners: RwLock<Vec<(u64, Arc<dyn LogListener>)>>,
    next_listener_id: AtomicU64,
    parent: Option<Arc<Console>>,
    input: Mutex<InputSlot>,
    input_changed: Condvar,
}

impl Console {
    /// Create an unbounded root console
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::build(name.into(), -1, OverflowPolicy::DropOldest, None)
    }

    /// Create a root console from settings
    pub fn with_settings(name: impl Into<String>, settings: &ConsoleSettings) -> Arc<Self> {
        Self::build(name.into(), settings.max_lines, settings.overflow, None)
    }

    /// Create a console that mirrors every entry into `parent` and shares
    /// its retention bound and overflow policy
    pub fn child(name: impl Into<String>, parent: &Arc<Console>) -> Arc<Self> {
        Self::build(
            name.into(),
            parent.max_lines(),
            parent.overflow,
            Some(Arc::clone(parent)),
        )
    }

    fn build(
        name: String,
        max_lines: i64,
        overflow: OverflowPolicy,
        parent: Option<Arc<Console>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            next_id: AtomicU64::new(0),
            buffer: Mutex::new(VecDeque::new()),
            max_lines: AtomicI64::new(max_lines),
            overflow,
            delivery: ReentrantMutex::new(()),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
            parent,
            input: Mutex::new(InputSlot::default()),
            input_changed: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<Console>> {
        self.parent.as_ref()
    }

    /// Append an entry and notify subscribers
    pub fn println(&self, level: LogLevel, text: impl Into<String>) -> LogEntry {
        let text = text.into();
        let entry = {
            let _delivery = self.delivery.lock();

            let (entry, overflowed) = {
                let mut buffer = self.buffer.lock();
                let entry = LogEntry {
                    id: self.next_id.fetch_add(1, Ordering::SeqCst),
                    level,
                    content: text.clone(),
                    new_line: true,
                };
                buffer.push_back(entry.clone());

                let max = self.max_lines.load(Ordering::Relaxed);
                let mut overflowed = false;
                if max > 0 && buffer.len() as i64 > max {
                    match self.overflow {
                        OverflowPolicy::DropOldest => {
                            while buffer.len() as i64 > max {
                                buffer.pop_front();
                            }
                        }
                        OverflowPolicy::Clear => overflowed = true,
                    }
                }
                (entry, overflowed)
            };

            trace!(console = %self.name, id = entry.id, "{}", entry);
            for listener in self.snapshot_listeners() {
                listener.on_new_log(&entry);
            }

            if overflowed {
                self.clear();
            }
            entry
        };

        if let Some(parent) = &self.parent {
            parent.println(level, text);
        }
        entry
    }

    pub fn verbose(&self, text: impl Into<String>) -> LogEntry {
        self.println(LogLevel::Verbose, text)
    }

    pub fn debug(&self, text: impl Into<String>) -> LogEntry {
        self.println(LogLevel::Debug, text)
    }

    /// `console.log` level
    pub fn log(&self, text: impl Into<String>) -> LogEntry {
        self.println(LogLevel::Debug, text)
    }

    pub fn info(&self, text: impl Into<String>) -> LogEntry {
        self.println(LogLevel::Info, text)
    }

    pub fn warn(&self, text: impl Into<String>) -> LogEntry {
        self.println(LogLevel::Warn, text)
    }

    pub fn error(&self, text: impl Into<String>) -> LogEntry {
        self.println(LogLevel::Error, text)
    }

    /// Empty the buffer and emit a clear event
    pub fn clear(&self) {
        let _delivery = self.delivery.lock();
        self.buffer.lock().clear();
        debug!(console = %self.name, "Console cleared");
        for listener in self.snapshot_listeners() {
            listener.on_log_clear();
        }
    }

    /// Set the retention bound; `n <= 0` disables it
    pub fn set_max_lines(&self, n: i64) {
        self.max_lines.store(n, Ordering::Relaxed);

        if n > 0 {
            let _delivery = self.delivery.lock();
            let overflowed = {
                let mut buffer = self.buffer.lock();
                match self.overflow {
                    OverflowPolicy::DropOldest => {
                        while buffer.len() as i64 > n {
                            buffer.pop_front();
                        }
                        false
                    }
                    OverflowPolicy::Clear => buffer.len() as i64 > n,
                }
            };
            if overflowed {
                self.clear();
            }
        }
    }

    pub fn max_lines(&self) -> i64 {
        self.max_lines.load(Ordering::Relaxed)
    }

    /// Snapshot of the retained entries
    pub fn entries(&self) -> Vec<LogEntry> {
        self.buffer.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Contents of retained error-level entries
    pub fn error_lines(&self) -> Vec<String> {
        self.buffer
            .lock()
            .iter()
            .filter(|e| e.level >= LogLevel::Error)
            .map(|e| e.content.clone())
            .collect()
    }

    /// Register a subscriber; it stays registered until the handle drops
    pub fn subscribe(self: &Arc<Self>, listener: Arc<dyn LogListener>) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        Subscription {
            console: Arc::downgrade(self),
            id,
        }
    }

    /// Register a closure receiving [`ConsoleEvent`]s
    pub fn subscribe_fn<F>(self: &Arc<Self>, f: F) -> Subscription
    where
        F: Fn(ConsoleEvent) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnListener(f)))
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn LogListener>> {
        self.listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }

    fn remove_listener(&self, id: u64) {
        self.listeners.write().retain(|(lid, _)| *lid != id);
    }

    /// Mark the UI input surface as available (or gone)
    pub fn attach_input_surface(&self, attached: bool) {
        let mut slot = self.input.lock();
        slot.surface_attached = attached;
        self.input_changed.notify_all();
    }

    /// Deliver user input to a pending `raw_input`. Returns false when
    /// nobody is waiting or input was already delivered.
    pub fn submit_input(&self, text: impl Into<String>) -> bool {
        let mut slot = self.input.lock();
        if !slot.waiting || slot.pending.is_some() {
            return false;
        }
        slot.pending = Some(text.into());
        self.input_changed.notify_all();
        true
    }

    /// Wake any blocked `raw_input` so it re-checks its cancel condition
    pub fn wake_input(&self) {
        let _slot = self.input.lock();
        self.input_changed.notify_all();
    }

    /// Close the console: pending and future reads fail
    pub fn close(&self) {
        let mut slot = self.input.lock();
        slot.closed = true;
        self.input_changed.notify_all();
    }

    /// Block until the user submits a line of input.
    ///
    /// Waits up to [`INPUT_SURFACE_TIMEOUT`] for an input surface, then
    /// indefinitely for input. Returns `EngineTerminated` once `cancelled`
    /// reports true and `IllegalState` if the console is closed.
    pub fn raw_input(&self, cancelled: &dyn Fn() -> bool) -> Result<String> {
        let mut slot = self.input.lock();
        if slot.closed {
            return Err(EngineError::IllegalState("console is closed".into()));
        }
        slot.waiting = true;
        slot.pending = None;

        let surface_deadline = Instant::now() + INPUT_SURFACE_TIMEOUT;
        let result = loop {
            if slot.closed {
                break Err(EngineError::IllegalState("console is closed".into()));
            }
            if cancelled() {
                break Err(EngineError::EngineTerminated);
            }
            if let Some(text) = slot.pending.take() {
                break Ok(text);
            }
            if !slot.surface_attached && Instant::now() >= surface_deadline {
                break Err(EngineError::IllegalState(
                    "console input surface did not become available".into(),
                ));
            }
            self.input_changed.wait_for(&mut slot, INPUT_POLL_INTERVAL);
        };

        slot.waiting = false;
        result
    }
}

/// Subscription handle; dropping it unsubscribes
pub struct Subscription {
    console: Weak<Console>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(console) = self.console.upgrade() {
            console.remove_listener(self.id);
        }
    }
}
