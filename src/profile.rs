//! Per-attempt execution reports.
//!
//! Listeners only observe; nothing they do affects scheduling.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::owner::TaskOwner;

/// What happened to one attempt of a task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_type: String,
    pub owner: TaskOwner,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    pub transactional: bool,
    /// Ready-queue depth when the attempt was dispatched.
    pub ready_count: usize,
    pub thread_count: usize,
    pub duration: Duration,
    /// The failure message, if the attempt failed.
    pub failure: Option<String>,
}

impl TaskReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

pub trait ProfileListener: Send + Sync {
    fn report(&self, report: &TaskReport);

    fn thread_started(&self) {}

    fn thread_stopped(&self) {}
}

/// Fans reports out to every registered listener.
#[derive(Default)]
pub(crate) struct ProfileCollector {
    listeners: RwLock<Vec<Arc<dyn ProfileListener>>>,
}

impl ProfileCollector {
    pub(crate) fn add(&self, listener: Arc<dyn ProfileListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn report(&self, report: &TaskReport) {
        for listener in self.listeners.read().iter() {
            listener.report(report);
        }
    }

    pub(crate) fn thread_started(&self) {
        for listener in self.listeners.read().iter() {
            listener.thread_started();
        }
    }

    pub(crate) fn thread_stopped(&self) {
        for listener in self.listeners.read().iter() {
            listener.thread_stopped();
        }
    }
}
