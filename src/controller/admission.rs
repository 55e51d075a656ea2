// src/controller/admission.rs
//! Concurrency cap with strict submission-order admission
//!
//! Tasks are enqueued synchronously when submitted, so admission order is
//! submission order regardless of how the async tasks get scheduled.
//! A finished task hands its slot directly to the oldest waiter.

use crate::controller::task::TaskId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Result of enqueueing a task
pub(crate) enum Admission {
    /// A slot was free; the task holds it now
    Ready,

    /// Resolves once a slot is handed over
    Queued(oneshot::Receiver<()>),
}

#[derive(Default)]
struct QueueState {
    running: usize,
    waiting: VecDeque<(TaskId, oneshot::Sender<()>)>,
}

pub(crate) struct AdmissionQueue {
    /// Slot count; 0 admits everything immediately
    limit: usize,
    state: Mutex<QueueState>,
}

impl AdmissionQueue {
    pub(crate) fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            state: Mutex::new(QueueState::default()),
        })
    }

    pub(crate) fn enqueue(&self, id: TaskId) -> Admission {
        let mut state = self.state.lock();
        if self.limit == 0 || state.running < self.limit {
            state.running += 1;
            Admission::Ready
        } else {
            let (tx, rx) = oneshot::channel();
            state.waiting.push_back((id, tx));
            Admission::Queued(rx)
        }
    }

    /// Remove a waiting task. Returns false when it is no longer waiting,
    /// i.e. a slot was already handed to it.
    pub(crate) fn withdraw(&self, id: TaskId) -> bool {
        let mut state = self.state.lock();
        match state.waiting.iter().position(|(waiting, _)| *waiting == id) {
            Some(index) => {
                state.waiting.remove(index);
                true
            }
            None => false,
        }
    }

    /// Give a slot back, handing it to the oldest live waiter
    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        while let Some((_, tx)) = state.waiting.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }
        state.running = state.running.saturating_sub(1);
    }

    pub(crate) fn running(&self) -> usize {
        self.state.lock().running
    }

    pub(crate) fn queued(&self) -> usize {
        self.state.lock().waiting.len()
    }
}

/// Slot held by a running task; released on drop
pub(crate) struct AdmissionPermit {
    queue: Arc<AdmissionQueue>,
}

impl AdmissionPermit {
    pub(crate) fn new(queue: Arc<AdmissionQueue>) -> Self {
        Self { queue }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.queue.release();
    }
}
