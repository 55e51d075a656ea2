// src/controller/engine_controller.rs
//! Engine registry and controller
//!
//! Tracks every submitted run as a [`TaskInfo`], admits runs through the
//! concurrency cap in submission order and executes each on its own
//! blocking worker with a fresh engine.
//!
//! # Flow
//!
//! ```text
//! run_script ──▶ Pending ──admitted──▶ Running ──▶ Succeeded | Failed | Stopped
//!                   │                                              ▲
//!                   └──────────── stop() while queued ─────────────┘
//! ```
//!
//! The task map is guarded by a single lock; listeners and observers are
//! always called after it has been released.

use crate::console::Console;
use crate::controller::admission::{Admission, AdmissionPermit, AdmissionQueue};
use crate::controller::listener::{ExecutionListener, TaskObserver};
use crate::controller::task::{TaskEvent, TaskId, TaskInfo, TaskState};
use crate::runtime::{ExecutionConfig, ScriptRuntime, ScriptSource, StopHandle};
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

struct TaskRecord {
    info: TaskInfo,
    console: Arc<Console>,
    stop_requested: bool,
    cancel: Arc<Notify>,
    updates: watch::Sender<TaskInfo>,
    finished: Option<Instant>,
}

struct ControllerInner {
    runtime: Arc<ScriptRuntime>,
    handle: Handle,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<TaskId, TaskRecord>>,
    stop_handles: DashMap<TaskId, Arc<StopHandle>>,
    admission: Arc<AdmissionQueue>,
    retention: Duration,
    observers: RwLock<Vec<(u64, Arc<dyn TaskObserver>)>>,
    next_observer: AtomicU64,
}

/// Dispatches runs and tracks their state. Cheap to clone.
#[derive(Clone)]
pub struct EngineController {
    inner: Arc<ControllerInner>,
}

impl EngineController {
    /// Create a controller. Must be called from within a Tokio runtime,
    /// which is used to drive the submitted runs.
    pub fn new(runtime: Arc<ScriptRuntime>) -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| {
            EngineError::IllegalState("EngineController must be created inside a Tokio runtime".into())
        })?;
        let settings = runtime.config().controller.clone();
        info!(
            max_concurrent = settings.max_concurrent,
            retention_secs = settings.retention_secs,
            "Engine controller ready"
        );

        Ok(Self {
            inner: Arc::new(ControllerInner {
                runtime,
                handle,
                next_id: AtomicU64::new(1),
                tasks: Mutex::new(HashMap::new()),
                stop_handles: DashMap::new(),
                admission: AdmissionQueue::new(settings.max_concurrent),
                retention: settings.retention(),
                observers: RwLock::new(Vec::new()),
                next_observer: AtomicU64::new(0),
            }),
        })
    }

    pub fn runtime(&self) -> &Arc<ScriptRuntime> {
        &self.inner.runtime
    }

    /// Submit a run. The returned record is in the `Pending` state; the
    /// listener receives `on_start` and then exactly one terminal callback.
    pub fn run_script(
        &self,
        source: ScriptSource,
        config: ExecutionConfig,
        listener: Arc<dyn ExecutionListener>,
    ) -> TaskInfo {
        let inner = &self.inner;
        inner.prune();

        let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
        let info = TaskInfo::new(id, source.name(), source.identity());
        let console = Console::child(format!("task-{}", id), inner.runtime.console());
        let cancel = Arc::new(Notify::new());
        let (updates, _) = watch::channel(info.clone());

        // Admission is decided under the task lock so that ids and queue
        // positions agree.
        let admission = {
            let mut tasks = inner.tasks.lock();
            tasks.insert(
                id,
                TaskRecord {
                    info: info.clone(),
                    console: Arc::clone(&console),
                    stop_requested: false,
                    cancel: Arc::clone(&cancel),
                    updates,
                    finished: None,
                },
            );
            inner.admission.enqueue(id)
        };
        debug!(task = id, source = %info.source, "Script submitted");

        let driver = Arc::clone(inner);
        inner.handle.spawn(async move {
            driver
                .drive(id, source, config, listener, admission, cancel, console)
                .await;
        });
        info
    }

    /// Request a stop. `Ok(true)` if a stop was issued, `Ok(false)` if the
    /// task already finished or its record expired.
    pub fn stop(&self, id: TaskId) -> Result<bool> {
        let cancel = {
            let mut tasks = self.inner.tasks.lock();
            match tasks.get_mut(&id) {
                None if self.inner.was_issued(id) => return Ok(false),
                None => return Err(EngineError::TaskNotFound(id)),
                Some(record) if record.info.state.is_terminal() => return Ok(false),
                Some(record) => {
                    record.stop_requested = true;
                    Arc::clone(&record.cancel)
                }
            }
        };

        cancel.notify_one();
        let handle = self
            .inner
            .stop_handles
            .get(&id)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(handle) = handle {
            handle.force_stop();
        }
        info!(task = id, "Stop requested");
        Ok(true)
    }

    /// Request a stop on every unfinished task; returns how many were
    /// signalled
    pub fn stop_all_scripts(&self) -> usize {
        let ids: Vec<TaskId> = self
            .inner
            .tasks
            .lock()
            .values()
            .filter(|record| !record.info.state.is_terminal())
            .map(|record| record.info.id)
            .collect();

        let count = ids
            .into_iter()
            .filter(|id| matches!(self.stop(*id), Ok(true)))
            .count();
        info!("Stop requested for {} scripts", count);
        count
    }

    pub fn task(&self, id: TaskId) -> Result<TaskInfo> {
        self.inner.prune();
        self.inner
            .tasks
            .lock()
            .get(&id)
            .map(|record| record.info.clone())
            .ok_or(EngineError::TaskNotFound(id))
    }

    /// All retained tasks ordered by id
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.inner.prune();
        let mut tasks: Vec<TaskInfo> = self
            .inner
            .tasks
            .lock()
            .values()
            .map(|record| record.info.clone())
            .collect();
        tasks.sort_by_key(|task| task.id);
        tasks
    }

    pub fn running_tasks(&self) -> Vec<TaskInfo> {
        self.tasks()
            .into_iter()
            .filter(|task| task.state == TaskState::Running)
            .collect()
    }

    /// Console of a task; its entries are mirrored to the global console
    pub fn task_console(&self, id: TaskId) -> Result<Arc<Console>> {
        self.inner.prune();
        self.inner
            .tasks
            .lock()
            .get(&id)
            .map(|record| Arc::clone(&record.console))
            .ok_or(EngineError::TaskNotFound(id))
    }

    /// Wait until the task reaches a terminal state
    pub async fn wait(&self, id: TaskId) -> Result<TaskInfo> {
        let mut updates = {
            let tasks = self.inner.tasks.lock();
            tasks
                .get(&id)
                .ok_or(EngineError::TaskNotFound(id))?
                .updates
                .subscribe()
        };
        let info = updates
            .wait_for(|info| info.state.is_terminal())
            .await
            .map_err(|_| EngineError::TaskNotFound(id))?
            .clone();
        Ok(info)
    }

    /// Wait for every unfinished task
    pub async fn wait_all(&self) {
        let pending: Vec<TaskId> = self
            .tasks()
            .into_iter()
            .filter(|task| !task.state.is_terminal())
            .map(|task| task.id)
            .collect();
        for id in pending {
            let _ = self.wait(id).await;
        }
    }

    /// Register an observer for every task transition
    pub fn subscribe(&self, observer: Arc<dyn TaskObserver>) -> ObserverSubscription {
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.write().push((id, observer));
        ObserverSubscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }
}

impl ControllerInner {
    fn was_issued(&self, id: TaskId) -> bool {
        id > 0 && id < self.next_id.load(Ordering::SeqCst)
    }

    fn stop_requested(&self, id: TaskId) -> bool {
        self.tasks
            .lock()
            .get(&id)
            .map(|record| record.stop_requested)
            .unwrap_or(false)
    }

    /// Drop finished tasks older than the retention window
    fn prune(&self) {
        let now = Instant::now();
        let retention = self.retention;
        self.tasks.lock().retain(|_, record| {
            record
                .finished
                .map_or(true, |finished| now.duration_since(finished) < retention)
        });
    }

    /// Apply a transition and notify observers outside the lock
    fn transition(
        &self,
        id: TaskId,
        next: TaskState,
        update: impl FnOnce(&mut TaskInfo),
    ) -> Option<TaskInfo> {
        let task = {
            let mut tasks = self.tasks.lock();
            let record = tasks.get_mut(&id)?;
            if !record.info.state.can_transition_to(next) {
                warn!(
                    task = id,
                    "Ignoring transition {:?} -> {:?}", record.info.state, next
                );
                return None;
            }

            record.info.state = next;
            if next == TaskState::Running {
                record.info.started_at = Some(chrono::Utc::now());
            } else {
                record.info.finished_at = Some(chrono::Utc::now());
                record.finished = Some(Instant::now());
            }
            update(&mut record.info);
            record.updates.send_replace(record.info.clone());
            record.info.clone()
        };

        let event = TaskEvent::of(&task);
        let observers: Vec<Arc<dyn TaskObserver>> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer.on_task_event(&event);
        }
        Some(task)
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        self: Arc<Self>,
        id: TaskId,
        source: ScriptSource,
        config: ExecutionConfig,
        listener: Arc<dyn ExecutionListener>,
        admission: Admission,
        cancel: Arc<Notify>,
        console: Arc<Console>,
    ) {
        let permit = match admission {
            Admission::Ready => Some(AdmissionPermit::new(Arc::clone(&self.admission))),
            Admission::Queued(granted) => {
                debug!(task = id, "Waiting for a free engine slot");
                tokio::select! {
                    result = granted => result
                        .ok()
                        .map(|_| AdmissionPermit::new(Arc::clone(&self.admission))),
                    _ = cancel.notified() => {
                        if !self.admission.withdraw(id) {
                            // The slot was handed over as the stop arrived
                            self.admission.release();
                        }
                        None
                    }
                }
            }
        };

        let Some(task) = self.transition(id, TaskState::Running, |_| {}) else {
            return;
        };
        listener.on_start(&task);

        let permit = match permit {
            Some(permit) if !self.stop_requested(id) => permit,
            _ => {
                debug!(task = id, "Stopped before an engine was allocated");
                if let Some(task) = self.transition(id, TaskState::Stopped, |_| {}) {
                    counter!("autox_scripts_finished_total", "outcome" => "stopped").increment(1);
                    listener.on_stopped(&task);
                }
                return;
            }
        };

        counter!("autox_scripts_started_total").increment(1);
        gauge!("autox_scripts_running").increment(1.0);

        let worker = Arc::clone(&self);
        let outcome = tokio::task::spawn_blocking(move || worker.run_engine(id, &source, config, console))
            .await
            .unwrap_or_else(|e| {
                error!(task = id, "Script worker panicked: {}", e);
                Err(EngineError::IllegalState(format!("script worker panicked: {}", e)))
            });

        gauge!("autox_scripts_running").decrement(1.0);
        drop(permit);

        let stop_requested = self.stop_requested(id);
        match outcome {
            Ok(value) => {
                let result = value.clone();
                if let Some(task) = self.transition(id, TaskState::Succeeded, move |info| {
                    info.result = Some(result)
                }) {
                    info!(task = id, "Script succeeded");
                    counter!("autox_scripts_finished_total", "outcome" => "succeeded").increment(1);
                    listener.on_success(&task, &value);
                }
            }
            Err(err) if err.is_termination() || stop_requested => {
                if let Some(task) = self.transition(id, TaskState::Stopped, |_| {}) {
                    info!(task = id, "Script stopped");
                    counter!("autox_scripts_finished_total", "outcome" => "stopped").increment(1);
                    listener.on_stopped(&task);
                }
            }
            Err(err) => {
                let message = err.to_string();
                if let Some(task) = self.transition(id, TaskState::Failed, move |info| {
                    info.error = Some(message)
                }) {
                    warn!(task = id, "Script failed: {}", err);
                    counter!("autox_scripts_finished_total", "outcome" => "failed").increment(1);
                    listener.on_exception(&task, &err);
                }
            }
        }
    }

    /// Runs on a blocking worker thread: engine allocation to release
    fn run_engine(
        &self,
        id: TaskId,
        source: &ScriptSource,
        config: ExecutionConfig,
        console: Arc<Console>,
    ) -> Result<serde_json::Value> {
        let kind = self.runtime.select_kind(source, &config);
        if let Some(record) = self.tasks.lock().get_mut(&id) {
            record.info.engine = Some(kind);
        }

        let mut engine = self.runtime.create_engine(kind, config, console, Some(id));
        let handle = engine.stop_handle();
        self.stop_handles.insert(id, Arc::clone(&handle));

        let result = engine.init().and_then(|_| {
            // A stop that raced with allocation found no initialised engine
            if self.stop_requested(id) {
                handle.force_stop();
            }
            engine.execute(source)
        });

        engine.destroy();
        self.stop_handles.remove(&id);
        result
    }
}

/// Observer registration; dropping it unsubscribes
pub struct ObserverSubscription {
    inner: Weak<ControllerInner>,
    id: u64,
}

impl Drop for ObserverSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.observers.write().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::LogLevel;
    use crate::utils::config::RuntimeConfig;
    use serde_json::json;
    use tokio::time::timeout;

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl ExecutionListener for RecordingListener {
        fn on_start(&self, _task: &TaskInfo) {
            self.events.lock().push("start".into());
        }

        fn on_success(&self, _task: &TaskInfo, result: &serde_json::Value) {
            self.events.lock().push(format!("success:{}", result));
        }

        fn on_exception(&self, _task: &TaskInfo, error: &EngineError) {
            self.events.lock().push(format!("exception:{}", error));
        }

        fn on_stopped(&self, _task: &TaskInfo) {
            self.events.lock().push("stopped".into());
        }
    }

    fn controller_with(configure: impl FnOnce(&mut RuntimeConfig)) -> EngineController {
        let mut config = RuntimeConfig::default();
        configure(&mut config);
        EngineController::new(Arc::new(ScriptRuntime::new(config))).unwrap()
    }

    fn inline(code: &str) -> ScriptSource {
        ScriptSource::inline("main", code)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hello_scenario() {
        let controller = controller_with(|_| {});
        let listener = Arc::new(RecordingListener::default());
        let task = controller.run_script(
            inline("console.log('hi'); 1+1"),
            ExecutionConfig::default(),
            listener.clone(),
        );

        let queried = controller.task(task.id).unwrap();
        assert!(matches!(queried.state, TaskState::Pending | TaskState::Running));

        let done = controller.wait(task.id).await.unwrap();
        assert_eq!(done.state, TaskState::Succeeded);
        assert_eq!(done.result, Some(json!(2)));
        assert!(done.started_at.is_some() && done.finished_at.is_some());
        assert_eq!(listener.events(), vec!["start", "success:2"]);

        let console = controller.task_console(task.id).unwrap();
        let entries = console.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "hi");
        assert_eq!(controller.runtime().console().entries()[0].content, "hi");
        assert_eq!(controller.task(task.id).unwrap().state, TaskState::Succeeded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_force_stop_scenario() {
        let controller = controller_with(|_| {});
        let listener = Arc::new(RecordingListener::default());
        let task = controller.run_script(
            inline("while(true){}"),
            ExecutionConfig::default(),
            listener.clone(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(controller.stop(task.id).unwrap());

        let done = timeout(Duration::from_millis(2000), controller.wait(task.id))
            .await
            .expect("stop within grace period")
            .unwrap();
        assert_eq!(done.state, TaskState::Stopped);
        assert_eq!(listener.events(), vec!["start", "stopped"]);
        assert!(!controller.stop(task.id).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exception_scenario() {
        let controller = controller_with(|_| {});
        let listener = Arc::new(RecordingListener::default());
        let task = controller.run_script(
            inline("throw new Error('boom')"),
            ExecutionConfig::default(),
            listener.clone(),
        );

        let done = controller.wait(task.id).await.unwrap();
        assert_eq!(done.state, TaskState::Failed);
        assert!(done.error.unwrap().contains("boom"));

        let events = listener.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], "start");
        assert!(events[1].starts_with("exception:") && events[1].contains("boom"));

        let console = controller.task_console(task.id).unwrap();
        assert!(console
            .entries()
            .iter()
            .any(|e| e.level == LogLevel::Error && e.content.contains("boom")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_are_independent() {
        let controller = controller_with(|_| {});
        let ids: Vec<TaskId> = (0..8)
            .map(|i| {
                controller
                    .run_script(
                        inline(&format!("var shared = {}; console.log('run ' + shared); shared", i)),
                        ExecutionConfig::default(),
                        Arc::new(crate::controller::NoopListener),
                    )
                    .id
            })
            .collect();

        for (i, id) in ids.iter().enumerate() {
            let done = controller.wait(*id).await.unwrap();
            assert_eq!(done.state, TaskState::Succeeded);
            assert_eq!(done.result, Some(json!(i)));
            let console = controller.task_console(*id).unwrap();
            assert_eq!(console.entries()[0].content, format!("run {}", i));
        }
        assert_eq!(controller.runtime().console().len(), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fifo_admission_with_cap() {
        let controller = controller_with(|c| c.controller.max_concurrent = 1);
        let started = Arc::new(Mutex::new(Vec::new()));
        let order = Arc::clone(&started);
        let _subscription = controller.subscribe(Arc::new(move |event: &TaskEvent| {
            if event.state == TaskState::Running {
                order.lock().push(event.task.id);
            }
        }));

        let first = controller.run_script(inline("sleep(200); 1"), ExecutionConfig::default(), Arc::new(crate::controller::NoopListener));
        let ids: Vec<TaskId> = (0..4)
            .map(|i| {
                controller
                    .run_script(inline(&format!("{}", i)), ExecutionConfig::default(), Arc::new(crate::controller::NoopListener))
                    .id
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(controller.task(ids[0]).unwrap().state, TaskState::Pending);
        assert_eq!(controller.running_tasks().len(), 1);

        for id in &ids {
            controller.wait(*id).await.unwrap();
        }
        let mut expected = vec![first.id];
        expected.extend(ids);
        assert_eq!(*started.lock(), expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_while_pending() {
        let controller = controller_with(|c| c.controller.max_concurrent = 1);
        let blocker = controller.run_script(inline("while(true){}"), ExecutionConfig::default(), Arc::new(crate::controller::NoopListener));
        let listener = Arc::new(RecordingListener::default());
        let queued = controller.run_script(inline("console.log('never')"), ExecutionConfig::default(), listener.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(controller.stop(queued.id).unwrap());
        let done = controller.wait(queued.id).await.unwrap();
        assert_eq!(done.state, TaskState::Stopped);
        assert_eq!(done.engine, None);
        assert_eq!(listener.events(), vec!["start", "stopped"]);

        assert!(controller.stop(blocker.id).unwrap());
        assert_eq!(controller.wait(blocker.id).await.unwrap().state, TaskState::Stopped);

        // The slot is free again
        let next = controller.run_script(inline("3"), ExecutionConfig::default(), Arc::new(crate::controller::NoopListener));
        assert_eq!(controller.wait(next.id).await.unwrap().result, Some(json!(3)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_all_scripts() {
        let controller = controller_with(|_| {});
        let a = controller.run_script(inline("while(true){}"), ExecutionConfig::default(), Arc::new(crate::controller::NoopListener));
        let b = controller.run_script(inline("setInterval(() => {}, 10)"), ExecutionConfig::default(), Arc::new(crate::controller::NoopListener));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(controller.stop_all_scripts(), 2);
        for id in [a.id, b.id] {
            let done = timeout(Duration::from_secs(2), controller.wait(id)).await.unwrap().unwrap();
            assert_eq!(done.state, TaskState::Stopped);
        }
        assert_eq!(controller.stop_all_scripts(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unknown_and_expired_tasks() {
        let controller = controller_with(|c| c.controller.retention_secs = 0);
        assert!(matches!(controller.stop(999), Err(EngineError::TaskNotFound(999))));
        assert!(matches!(controller.task(0), Err(EngineError::TaskNotFound(0))));

        let task = controller.run_script(inline("1"), ExecutionConfig::default(), Arc::new(crate::controller::NoopListener));
        let done = controller.wait(task.id).await.unwrap();
        assert_eq!(done.state, TaskState::Succeeded);

        assert!(matches!(controller.task(task.id), Err(EngineError::TaskNotFound(_))));
        assert!(!controller.stop(task.id).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_observers_see_ordered_transitions() {
        let controller = controller_with(|_| {});
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = controller.subscribe(Arc::new(move |event: &TaskEvent| {
            sink.lock().push((event.task.id, event.state));
        }));

        let task = controller.run_script(inline("1"), ExecutionConfig::default(), Arc::new(crate::controller::NoopListener));
        controller.wait(task.id).await.unwrap();
        assert_eq!(
            *seen.lock(),
            vec![(task.id, TaskState::Running), (task.id, TaskState::Succeeded)]
        );

        drop(subscription);
        let other = controller.run_script(inline("2"), ExecutionConfig::default(), Arc::new(crate::controller::NoopListener));
        controller.wait(other.id).await.unwrap();
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_listener_may_reenter_controller() {
        struct Reentrant {
            controller: EngineController,
            seen: Mutex<Vec<TaskState>>,
        }

        impl ExecutionListener for Reentrant {
            fn on_start(&self, task: &TaskInfo) {
                let state = self.controller.task(task.id).unwrap().state;
                self.seen.lock().push(state);
            }

            fn on_success(&self, task: &TaskInfo, _result: &serde_json::Value) {
                let state = self.controller.task(task.id).unwrap().state;
                self.seen.lock().push(state);
                let _ = self.controller.stop_all_scripts();
            }
        }

        let controller = controller_with(|_| {});
        let listener = Arc::new(Reentrant {
            controller: controller.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let task = controller.run_script(inline("1"), ExecutionConfig::default(), listener.clone());
        controller.wait(task.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            *listener.seen.lock(),
            vec![TaskState::Running, TaskState::Succeeded]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_timeout_marks_task_failed() {
        let controller = controller_with(|_| {});
        let task = controller.run_script(
            inline("while(true){}"),
            ExecutionConfig::default().with_timeout(Duration::from_millis(100)),
            Arc::new(crate::controller::NoopListener),
        );
        let done = timeout(Duration::from_secs(2), controller.wait(task.id)).await.unwrap().unwrap();
        assert_eq!(done.state, TaskState::Failed);
        assert!(done.error.unwrap().contains("timed out"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_task_console_respects_retention_bound() {
        let controller = controller_with(|c| c.console.max_lines = 100);
        let task = controller.run_script(
            inline("for (let i = 0; i < 5000; i++) console.log('line ' + i)"),
            ExecutionConfig::default(),
            Arc::new(crate::controller::NoopListener),
        );
        let done = controller.wait(task.id).await.unwrap();
        assert_eq!(done.state, TaskState::Succeeded);

        let console = controller.task_console(task.id).unwrap();
        assert!(console.len() <= 100);
        assert_eq!(console.entries().last().unwrap().content, "line 4999");
        assert!(controller.runtime().console().len() <= 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_interrupts_raw_input() {
        let controller = controller_with(|_| {});
        let task = controller.run_script(
            inline("console.rawInput(); console.log('unreachable')"),
            ExecutionConfig::default(),
            Arc::new(crate::controller::NoopListener),
        );
        controller
            .task_console(task.id)
            .unwrap()
            .attach_input_surface(true);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        assert!(controller.stop(task.id).unwrap());
        let done = timeout(Duration::from_millis(1500), controller.wait(task.id))
            .await
            .expect("blocked read interrupted")
            .unwrap();
        assert_eq!(done.state, TaskState::Stopped);
        assert!(started.elapsed() < Duration::from_millis(1500));

        let console = controller.task_console(task.id).unwrap();
        assert!(console.entries().iter().all(|e| e.content != "unreachable"));
    }

    #[test]
    fn test_requires_tokio_runtime() {
        let runtime = Arc::new(ScriptRuntime::new(RuntimeConfig::default()));
        assert!(matches!(
            EngineController::new(runtime),
            Err(EngineError::IllegalState(_))
        ));
    }
}
