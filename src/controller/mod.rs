// src/controller/mod.rs
//! Engine registry and controller
//!
//! - **Task**: task records, states and transition events
//! - **Listener**: per-run callbacks and controller-wide observers
//! - **Admission**: concurrency cap with submission-order admission
//! - **Engine Controller**: dispatch, stop and query of runs
//!
//! # Architecture
//!
//! ```text
//! run_script ─▶ AdmissionQueue ─▶ spawn_blocking(engine) ─▶ terminal state
//!                    ▲                    │
//!      stop() ───────┴── StopHandle ◀─────┘
//! ```

pub(crate) mod admission;
pub mod engine_controller;
pub mod listener;
pub mod task;

pub use engine_controller::{EngineController, ObserverSubscription};
pub use listener::{ExecutionListener, NoopListener, TaskObserver};
pub use task::{TaskEvent, TaskId, TaskInfo, TaskState};
