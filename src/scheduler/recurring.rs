use std::sync::Arc;
use std::time::Instant;

use log::debug;
use parking_lot::Mutex;

use crate::errors::{Result, ThothError};
use crate::scheduler::task::ScheduledTask;
use crate::scheduler::{Admission, Shared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Started,
    Cancelled,
}

pub(crate) struct RecurringState {
    phase: Mutex<Phase>,
}

impl RecurringState {
    pub(crate) fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Created),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.phase.lock() == Phase::Cancelled
    }
}

/// Controls a recurring task.
///
/// Nothing runs until [`start`](Self::start) is called. Cancelling stops
/// every future firing; a firing that is already running completes.
pub struct RecurringTaskHandle {
    state: Arc<RecurringState>,
    shared: Arc<Shared>,
    first: Mutex<Option<(Instant, ScheduledTask)>>,
}

impl RecurringTaskHandle {
    pub(crate) fn new(
        shared: Arc<Shared>,
        state: Arc<RecurringState>,
        start: Instant,
        task: ScheduledTask,
    ) -> Self {
        Self {
            state,
            shared,
            first: Mutex::new(Some((start, task))),
        }
    }

    /// Queues the first firing.
    ///
    /// Fails if the handle was already started or has been cancelled. A start
    /// the scheduler rejects leaves the handle cancelled.
    pub fn start(&self) -> Result<()> {
        let mut phase = self.state.phase.lock();
        match *phase {
            Phase::Created => {}
            Phase::Started => {
                return Err(ThothError::InvalidState(
                    "recurring task already started".to_string(),
                ));
            }
            Phase::Cancelled => {
                return Err(ThothError::InvalidState(
                    "recurring task was cancelled".to_string(),
                ));
            }
        }
        let (start, task) = self.first.lock().take().ok_or_else(|| {
            ThothError::InvalidState("recurring task has no pending firing".to_string())
        })?;
        *phase = Phase::Started;
        drop(phase);

        let type_name = task.runnable.base_task_type().to_string();
        if let Err(e) = self.shared.enqueue(task, Some(start), Admission::New) {
            *self.state.phase.lock() = Phase::Cancelled;
            debug!("Recurring task {} could not start: {}", type_name, e);
            return Err(e);
        }
        Ok(())
    }

    /// Stops future firings. Calling it again has no effect.
    pub fn cancel(&self) {
        let mut phase = self.state.phase.lock();
        if *phase != Phase::Cancelled {
            *phase = Phase::Cancelled;
            self.first.lock().take();
            debug!("Recurring task cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}
